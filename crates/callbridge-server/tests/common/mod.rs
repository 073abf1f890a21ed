#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use callbridge_llm::{GenerationRequest, LlmError, TokenSource, TokenStream};
use callbridge_server::coordinator::{Coordinator, FrameSink, SessionSettings};
use callbridge_server::metrics::Metrics;
use callbridge_server::registry::SessionRegistry;
use callbridge_telephony::{CallGateway, OutboundCall, PlacedCall, TelephonyError};
use futures_util::stream;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// What the scripted source yields for one `generate` call.
pub enum Script {
    Tokens(Vec<&'static str>),
    /// Tokens followed by an error.
    Fail(Vec<&'static str>),
    /// Items pushed by the test, ending when the sender is dropped.
    Channel(mpsc::UnboundedReceiver<Result<String, LlmError>>),
    /// Never yields anything.
    Stall,
}

/// Token source that plays back queued scripts in order.
///
/// Once the queue is empty every generation yields `["ok"]`.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl TokenSource for ScriptedSource {
    fn generate(&self, request: GenerationRequest) -> TokenStream {
        self.prompts.lock().unwrap().push(request.prompt);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Tokens(vec!["ok"]));

        match script {
            Script::Tokens(tokens) => Box::pin(stream::iter(
                tokens.into_iter().map(|t| Ok(t.to_string())).collect::<Vec<_>>(),
            )),
            Script::Fail(tokens) => {
                let mut items: Vec<Result<String, LlmError>> =
                    tokens.into_iter().map(|t| Ok(t.to_string())).collect();
                items.push(Err(LlmError::Status {
                    status: 503,
                    message: "overloaded".into(),
                }));
                Box::pin(stream::iter(items))
            }
            Script::Channel(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            Script::Stall => Box::pin(stream::pending()),
        }
    }
}

/// Gateway that records requests and answers with a fixed result.
pub struct FakeGateway {
    pub fail: bool,
    pub calls: Mutex<Vec<OutboundCall>>,
}

impl FakeGateway {
    pub fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CallGateway for FakeGateway {
    async fn initiate_call(&self, call: &OutboundCall) -> Result<PlacedCall, TelephonyError> {
        self.calls.lock().unwrap().push(call.clone());
        if self.fail {
            return Err(TelephonyError::Provider {
                status: 400,
                code: Some(21211),
                message: "invalid number".into(),
            });
        }
        Ok(PlacedCall {
            sid: "CA0001".into(),
            status: Some("queued".into()),
        })
    }

    fn default_origin(&self) -> &str {
        "+15550001111"
    }
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        opening_line: "Hello {name}".into(),
        fallback_line: "Sorry, go on.".into(),
        instruction: "Reply briefly.".into(),
        generation_timeout: Some(Duration::from_secs(5)),
        idle_timeout: Some(Duration::from_secs(30)),
        max_call_duration: Some(Duration::from_secs(600)),
        ..SessionSettings::default()
    }
}

pub fn coordinator(
    source: Arc<dyn TokenSource>,
    settings: SessionSettings,
) -> (Coordinator, SessionRegistry, Arc<Metrics>) {
    let registry = SessionRegistry::new();
    let metrics = Arc::new(Metrics::new());
    let coordinator = Coordinator::new(registry.clone(), metrics.clone(), source, settings);
    (coordinator, registry, metrics)
}

/// Inbound half driven by the test: push frames with `tx`, drop it to close.
pub struct Peer {
    pub tx: mpsc::UnboundedSender<String>,
    pub out: mpsc::Receiver<String>,
}

/// Spawns `Coordinator::serve` on an in-memory channel pair.
pub fn spawn_serve(
    coordinator: &Coordinator,
) -> (
    Peer,
    tokio::task::JoinHandle<Option<callbridge_server::coordinator::SessionSummary>>,
) {
    spawn_serve_with_capacity(coordinator, 64)
}

/// Like [`spawn_serve`], with an outbound queue of `capacity` frames.
pub fn spawn_serve_with_capacity(
    coordinator: &Coordinator,
    capacity: usize,
) -> (
    Peer,
    tokio::task::JoinHandle<Option<callbridge_server::coordinator::SessionSummary>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (sink, out) = FrameSink::channel(capacity);
    let coordinator = coordinator.clone();
    let handle =
        tokio::spawn(async move { coordinator.serve(UnboundedReceiverStream::new(rx), sink).await });
    (Peer { tx, out }, handle)
}

pub fn start_frame(call_sid: &str) -> String {
    json!({
        "event": "start",
        "start": {
            "callSid": call_sid,
            "streamSid": format!("MZ-{}", call_sid),
            "customParameters": {"name": "Dana"}
        }
    })
    .to_string()
}

pub fn media_frame(text: &str) -> String {
    json!({
        "event": "media",
        "media": {"payload": STANDARD.encode(text.as_bytes())}
    })
    .to_string()
}

pub fn stop_frame() -> String {
    json!({"event": "stop"}).to_string()
}

/// Decodes the text carried by an outbound frame.
pub fn frame_text(frame: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(frame).unwrap();
    assert_eq!(value["event"], "media");
    let payload = value["media"]["payload"].as_str().unwrap();
    String::from_utf8(STANDARD.decode(payload).unwrap()).unwrap()
}

/// Receives the next outbound frame's text, failing after `secs`.
pub async fn next_text(out: &mut mpsc::Receiver<String>, secs: u64) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(secs), out.recv())
        .await
        .expect("timed out waiting for outbound frame")
        .expect("outbound channel closed");
    frame_text(&frame)
}
