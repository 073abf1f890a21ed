//! Media-stream WebSocket handler.

use crate::coordinator::FrameSink;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{future, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// How long the writer may take to flush queued frames after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler for `GET /media-stream`.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();

    let (sink, mut rx) = FrameSink::channel(state.outbound_buffer);

    // Drains queued frames to the socket; closes it once the session drops its sink.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let inbound = receiver
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });
    let inbound = Box::pin(inbound);

    let summary = state.coordinator.serve(inbound, sink).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        tracing::warn!("media writer did not drain in time, aborting");
        send_task.abort();
    }

    match summary {
        Some(summary) => tracing::debug!(
            call_sid = %summary.call_id,
            reason = %summary.reason,
            utterances = summary.transcript.len(),
            "media stream finished"
        ),
        None => tracing::debug!("media stream closed without a session"),
    }
}
