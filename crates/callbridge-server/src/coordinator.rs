//! Streaming session coordinator.
//!
//! One [`CallSession`] exists per open media stream. It is owned by the task
//! serving that stream and is never shared, so its transcript and in-flight
//! generation need no locking. [`Coordinator::serve`] drives a session with a
//! single `select!` loop that waits on the next inbound frame, the next
//! generated token, the hangup signal and the session timers.
//!
//! Outbound frames are enqueued through the session's [`FrameSink`]. A full
//! queue suspends the loop without dropping frames, but the hangup signal and
//! the session timers still end the call while it waits. The sink and the
//! token stream both live inside the session, and
//! [`CallSession::on_channel_close`] consumes the session: once it returns,
//! nothing can write to the channel and the generation request is dropped.

use crate::metrics::Metrics;
use crate::registry::SessionRegistry;
use callbridge_llm::{GenerationRequest, LlmError, TokenSource, TokenStream};
use callbridge_types::{
    FrameError, InboundEvent, MediaChunk, OutboundFrame, Speaker, StartMeta, Transcript,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, Sleep};
use uuid::Uuid;

/// Transcript text recorded for caller media that is not UTF-8 text.
pub const AUDIO_PLACEHOLDER: &str = "[audio]";

/// Behavior of every call session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub opening_line: String,
    pub fallback_line: String,
    pub instruction: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub context_turns: usize,
    pub generation_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_call_duration: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            opening_line: crate::config::default_opening_line(),
            fallback_line: crate::config::default_fallback_line(),
            instruction: crate::config::default_instruction(),
            max_tokens: 100,
            temperature: 0.8,
            context_turns: 6,
            generation_timeout: Some(Duration::from_secs(20)),
            idle_timeout: Some(Duration::from_secs(60)),
            max_call_duration: Some(Duration::from_secs(3600)),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl SessionSettings {
    pub fn from_config(
        conversation: &crate::config::ConversationConfig,
        media: &crate::config::MediaConfig,
    ) -> Self {
        Self {
            opening_line: conversation.opening_line.clone(),
            fallback_line: conversation.fallback_line.clone(),
            instruction: conversation.instruction.clone(),
            max_tokens: conversation.max_tokens,
            temperature: conversation.temperature,
            context_turns: conversation.context_turns,
            generation_timeout: non_zero_secs(conversation.generation_timeout_secs),
            idle_timeout: non_zero_secs(media.idle_timeout_secs),
            max_call_duration: non_zero_secs(media.max_call_secs),
        }
    }

    /// The opening line with `{name}` filled from the stream parameters.
    pub fn opening_for(&self, parameters: &BTreeMap<String, String>) -> String {
        let name = parameters
            .get("name")
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .unwrap_or("there");
        self.opening_line.replace("{name}", name)
    }
}

/// The outbound half of the channel is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("media channel closed")]
pub struct ChannelClosed;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("start event has no call identifier")]
    MissingCallSid,
}

/// Write half of one media stream.
///
/// Frames go through a bounded queue drained by the connection's writer
/// task; a full queue makes the sender wait rather than drop frames.
#[derive(Debug)]
pub struct FrameSink {
    tx: mpsc::Sender<String>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Creates a sink and the receiver its frames arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    async fn send(&self, frame: &OutboundFrame) -> Result<(), ChannelClosed> {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize outbound frame: {}", e);
                return Ok(());
            }
        };
        self.tx.send(json).await.map_err(|_| ChannelClosed)
    }
}

/// What the serving loop should do after an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The provider ended the stream.
    Hangup,
}

/// Next thing produced by the in-flight generation.
#[derive(Debug)]
pub enum GenerationEvent {
    Token(String),
    Complete,
    Failed(LlmError),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket.
    PeerClosed,
    /// The provider sent a `stop` event.
    Stopped,
    IdleTimeout,
    MaxDuration,
    /// Hangup requested through the registry (REST or a replacing stream).
    Hangup,
    /// The outbound writer went away.
    WriteFailed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Stopped => "stopped",
            Self::IdleTimeout => "idle_timeout",
            Self::MaxDuration => "max_duration",
            Self::Hangup => "hangup",
            Self::WriteFailed => "write_failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of a session, returned by [`CallSession::on_channel_close`].
#[derive(Debug)]
pub struct SessionSummary {
    pub call_id: String,
    pub reason: CloseReason,
    pub duration: Duration,
    pub transcript: Transcript,
    pub generations_started: u64,
    pub media_dropped: u64,
}

struct Generation {
    stream: TokenStream,
    reply: String,
    tokens: usize,
    deadline: Option<Instant>,
}

/// State of one call, owned by the task serving its media stream.
pub struct CallSession {
    call_id: String,
    stream_sid: Option<String>,
    connection_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    parameters: BTreeMap<String, String>,
    greeted: bool,
    transcript: Transcript,
    generation: Option<Generation>,
    generations_started: u64,
    media_dropped: u64,
    sink: FrameSink,
    hangup: Arc<Notify>,
    registry: SessionRegistry,
    metrics: Arc<Metrics>,
    source: Arc<dyn TokenSource>,
    settings: Arc<SessionSettings>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("connection_id", &self.connection_id)
            .field("started_at", &self.started_at)
            .field("transcript_len", &self.transcript.len())
            .field("generation_in_flight", &self.generation.is_some())
            .finish()
    }
}

fn caller_text(chunk: &MediaChunk) -> String {
    match std::str::from_utf8(&chunk.payload) {
        Ok(text) if !text.trim().is_empty() => text.to_string(),
        _ => AUDIO_PLACEHOLDER.to_string(),
    }
}

impl CallSession {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn generation_in_flight(&self) -> bool {
        self.generation.is_some()
    }

    pub fn generations_started(&self) -> u64 {
        self.generations_started
    }

    pub fn media_dropped(&self) -> u64 {
        self.media_dropped
    }

    /// Signal that ends this session when notified.
    pub fn hangup_signal(&self) -> Arc<Notify> {
        self.hangup.clone()
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ChannelClosed> {
        self.sink
            .send(&OutboundFrame::text(self.stream_sid.as_deref(), text))
            .await
    }

    /// Decodes and dispatches one raw text frame.
    ///
    /// Frames that fail to decode are logged and discarded without touching
    /// session state.
    pub async fn on_frame(&mut self, text: &str) -> Result<Disposition, ChannelClosed> {
        match InboundEvent::decode(text) {
            Ok(event) => self.on_event(event).await,
            Err(e) => {
                tracing::warn!(call_sid = %self.call_id, error = %e, "discarding malformed frame");
                Ok(Disposition::Continue)
            }
        }
    }

    pub async fn on_event(&mut self, event: InboundEvent) -> Result<Disposition, ChannelClosed> {
        match event {
            InboundEvent::Start(meta) => {
                if self.greeted {
                    tracing::warn!(
                        call_sid = %self.call_id,
                        repeated_call_sid = %meta.call_sid,
                        "ignoring repeated start event"
                    );
                } else {
                    self.greet().await?;
                }
                Ok(Disposition::Continue)
            }
            InboundEvent::Media(chunk) => {
                self.on_media(chunk);
                Ok(Disposition::Continue)
            }
            InboundEvent::Stop => Ok(Disposition::Hangup),
            InboundEvent::Other(kind) => {
                tracing::trace!(call_sid = %self.call_id, event = %kind, "ignoring event");
                Ok(Disposition::Continue)
            }
        }
    }

    async fn greet(&mut self) -> Result<(), ChannelClosed> {
        self.greeted = true;
        let opening = self.settings.opening_for(&self.parameters);
        self.transcript.push(Speaker::Agent, opening.clone());
        self.send_text(&opening).await
    }

    fn on_media(&mut self, chunk: MediaChunk) {
        self.transcript.push(Speaker::Caller, caller_text(&chunk));

        if self.generation.is_some() {
            // Interrupting a reply mid-sentence sounds broken; keep it going.
            self.media_dropped += 1;
            tracing::debug!(
                call_sid = %self.call_id,
                dropped = self.media_dropped,
                "generation in flight, not starting another"
            );
            return;
        }

        self.start_generation();
    }

    fn build_prompt(&self) -> String {
        let mut prompt = self.settings.instruction.clone();
        let context: Vec<String> = self
            .transcript
            .recent(self.settings.context_turns)
            .iter()
            .filter(|u| u.text != AUDIO_PLACEHOLDER)
            .map(|u| format!("{}: {}", u.speaker.label(), u.text))
            .collect();
        if !context.is_empty() {
            prompt.push_str("\n\nConversation so far:\n");
            prompt.push_str(&context.join("\n"));
        }
        prompt
    }

    fn start_generation(&mut self) {
        let request = GenerationRequest {
            prompt: self.build_prompt(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };
        let stream = self.source.generate(request);
        self.generation = Some(Generation {
            stream,
            reply: String::new(),
            tokens: 0,
            deadline: self.settings.generation_timeout.map(|t| Instant::now() + t),
        });
        self.generations_started += 1;
        tracing::debug!(
            call_sid = %self.call_id,
            generation = self.generations_started,
            "started generation"
        );
    }

    /// Waits for the next item of the in-flight generation.
    ///
    /// Never resolves while no generation is in flight. Cancel-safe: dropping
    /// the future loses nothing, so it can sit in a `select!`.
    pub async fn next_generation_event(&mut self) -> GenerationEvent {
        let Some(generation) = self.generation.as_mut() else {
            return std::future::pending().await;
        };

        let next = match generation.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, generation.stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return GenerationEvent::Failed(LlmError::Stream(
                            "timed out waiting for the next token".to_string(),
                        ))
                    }
                }
            }
            None => generation.stream.next().await,
        };

        match next {
            Some(Ok(token)) => GenerationEvent::Token(token),
            Some(Err(e)) => GenerationEvent::Failed(e),
            None => GenerationEvent::Complete,
        }
    }

    /// Forwards one token to the caller.
    pub async fn on_generation_token(&mut self, token: String) -> Result<(), ChannelClosed> {
        let limit = self.settings.generation_timeout;
        let Some(generation) = self.generation.as_mut() else {
            tracing::warn!(call_sid = %self.call_id, "token with no generation in flight, dropping");
            return Ok(());
        };
        generation.reply.push_str(&token);
        generation.tokens += 1;
        generation.deadline = limit.map(|t| Instant::now() + t);

        self.send_text(&token).await
    }

    /// Applies one item from the in-flight generation.
    pub async fn on_generation_event(
        &mut self,
        event: GenerationEvent,
    ) -> Result<(), ChannelClosed> {
        match event {
            GenerationEvent::Token(token) => self.on_generation_token(token).await,
            GenerationEvent::Complete => {
                self.on_generation_complete();
                Ok(())
            }
            GenerationEvent::Failed(e) => self.on_generation_error(e).await,
        }
    }

    pub fn on_generation_complete(&mut self) {
        if let Some(generation) = self.generation.take() {
            tracing::debug!(
                call_sid = %self.call_id,
                tokens = generation.tokens,
                "generation complete"
            );
            if !generation.reply.is_empty() {
                self.transcript.push(Speaker::Agent, generation.reply);
            }
        }
    }

    /// Ends the in-flight generation and sends the fallback line.
    pub async fn on_generation_error(&mut self, error: LlmError) -> Result<(), ChannelClosed> {
        let partial = self.generation.take();
        tracing::warn!(
            call_sid = %self.call_id,
            error = %error,
            tokens = partial.as_ref().map_or(0, |g| g.tokens),
            "generation failed, sending fallback"
        );
        if let Some(generation) = partial {
            if !generation.reply.is_empty() {
                self.transcript.push(Speaker::Agent, generation.reply);
            }
        }

        let fallback = self.settings.fallback_line.clone();
        self.transcript.push(Speaker::Agent, fallback.clone());
        self.send_text(&fallback).await
    }

    /// Tears the session down.
    ///
    /// Cancels any in-flight generation, releases the registry entry (unless a
    /// newer stream owns it) and records the call duration.
    pub fn on_channel_close(mut self, reason: CloseReason) -> SessionSummary {
        if let Some(generation) = self.generation.take() {
            tracing::info!(
                call_sid = %self.call_id,
                tokens = generation.tokens,
                "cancelling in-flight generation"
            );
            if !generation.reply.is_empty() {
                self.transcript.push(Speaker::Agent, generation.reply);
            }
        }

        let removed = self.registry.remove(&self.call_id, self.connection_id);
        let duration = self.clock.elapsed();
        self.metrics.record_call_duration(duration);

        tracing::info!(
            call_sid = %self.call_id,
            connection_id = %self.connection_id,
            reason = %reason,
            duration_secs = duration.as_secs(),
            transcript_len = self.transcript.len(),
            media_dropped = self.media_dropped,
            removed,
            "call session closed"
        );

        SessionSummary {
            call_id: self.call_id,
            reason,
            duration,
            transcript: self.transcript,
            generations_started: self.generations_started,
            media_dropped: self.media_dropped,
        }
    }
}

/// Creates sessions and serves media streams.
#[derive(Clone)]
pub struct Coordinator {
    registry: SessionRegistry,
    metrics: Arc<Metrics>,
    source: Arc<dyn TokenSource>,
    settings: Arc<SessionSettings>,
}

impl Coordinator {
    pub fn new(
        registry: SessionRegistry,
        metrics: Arc<Metrics>,
        source: Arc<dyn TokenSource>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry,
            metrics,
            source,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Registers a session for the call named by `start`.
    ///
    /// The opening line is sent when the `start` event itself is passed to
    /// [`CallSession::on_event`].
    pub fn on_channel_open(
        &self,
        start: &StartMeta,
        sink: FrameSink,
    ) -> Result<CallSession, SessionError> {
        let call_id = start.call_sid.trim();
        if call_id.is_empty() {
            return Err(SessionError::MissingCallSid);
        }

        let ticket = self.registry.register(call_id, start.stream_sid.clone());
        self.metrics.record_call_connected();

        tracing::info!(
            call_sid = %call_id,
            connection_id = %ticket.connection_id,
            stream_sid = ?start.stream_sid,
            "call session opened"
        );

        Ok(CallSession {
            call_id: ticket.call_id,
            stream_sid: start.stream_sid.clone(),
            connection_id: ticket.connection_id,
            started_at: ticket.started_at,
            clock: Instant::now(),
            parameters: start.custom_parameters.clone(),
            greeted: false,
            transcript: Transcript::new(),
            generation: None,
            generations_started: 0,
            media_dropped: 0,
            sink,
            hangup: ticket.hangup,
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            source: self.source.clone(),
            settings: self.settings.clone(),
        })
    }

    /// Serves one media stream until it ends.
    ///
    /// Returns `None` when the stream never produced a valid `start` event;
    /// the sink is dropped, which closes the channel.
    pub async fn serve<S>(&self, mut inbound: S, sink: FrameSink) -> Option<SessionSummary>
    where
        S: Stream<Item = String> + Unpin,
    {
        let start = self.await_start(&mut inbound).await?;

        let mut session = match self.on_channel_open(&start, sink) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting media stream");
                return None;
            }
        };

        let mut interrupts = Interrupts::new(session.hangup_signal(), &self.settings);
        let greeted = interrupts
            .guard(session.on_event(InboundEvent::Start(start)))
            .await;
        let reason = match greeted {
            Ok(_) => self.drive(&mut session, &mut inbound, &mut interrupts).await,
            Err(reason) => reason,
        };

        Some(session.on_channel_close(reason))
    }

    async fn await_start<S>(&self, inbound: &mut S) -> Option<StartMeta>
    where
        S: Stream<Item = String> + Unpin,
    {
        loop {
            let next = match self.settings.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, inbound.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::info!("no start event before idle timeout, closing stream");
                        return None;
                    }
                },
                None => inbound.next().await,
            };
            let text = next?;

            match InboundEvent::decode(&text) {
                Ok(InboundEvent::Start(meta)) => return Some(meta),
                Ok(InboundEvent::Stop) => return None,
                Ok(other) => {
                    tracing::debug!(event = other.kind(), "ignoring event before start");
                }
                Err(FrameError::InvalidStart(reason)) => {
                    tracing::warn!(%reason, "rejecting media stream: invalid start event");
                    return None;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "discarding malformed frame before start");
                }
            }
        }
    }

    async fn drive<S>(
        &self,
        session: &mut CallSession,
        inbound: &mut S,
        interrupts: &mut Interrupts,
    ) -> CloseReason
    where
        S: Stream<Item = String> + Unpin,
    {
        // Pending generation items are handled before the next inbound frame.
        loop {
            tokio::select! {
                biased;

                reason = interrupts.fired() => return reason,

                event = session.next_generation_event() => {
                    if let Err(reason) = interrupts.guard(session.on_generation_event(event)).await {
                        return reason;
                    }
                }

                frame = inbound.next() => {
                    let Some(text) = frame else {
                        return CloseReason::PeerClosed;
                    };
                    interrupts.touch();
                    match interrupts.guard(session.on_frame(&text)).await {
                        Ok(Disposition::Continue) => {}
                        Ok(Disposition::Hangup) => return CloseReason::Stopped,
                        Err(reason) => return reason,
                    }
                }
            }
        }
    }
}

/// Conditions that end a session whatever it is waiting on, including a
/// send blocked on a full outbound queue.
struct Interrupts {
    hangup: Arc<Notify>,
    idle_limit: Option<Duration>,
    idle: Pin<Box<Sleep>>,
    lifetime_limit: Option<Duration>,
    lifetime: Pin<Box<Sleep>>,
}

impl Interrupts {
    fn new(hangup: Arc<Notify>, settings: &SessionSettings) -> Self {
        Self {
            hangup,
            idle_limit: settings.idle_timeout,
            idle: Box::pin(tokio::time::sleep(settings.idle_timeout.unwrap_or_default())),
            lifetime_limit: settings.max_call_duration,
            lifetime: Box::pin(tokio::time::sleep(
                settings.max_call_duration.unwrap_or_default(),
            )),
        }
    }

    /// Restarts the idle timer.
    fn touch(&mut self) {
        if let Some(limit) = self.idle_limit {
            self.idle.as_mut().reset(Instant::now() + limit);
        }
    }

    async fn fired(&mut self) -> CloseReason {
        tokio::select! {
            biased;
            () = self.hangup.notified() => CloseReason::Hangup,
            () = &mut self.lifetime, if self.lifetime_limit.is_some() => CloseReason::MaxDuration,
            () = &mut self.idle, if self.idle_limit.is_some() => CloseReason::IdleTimeout,
        }
    }

    /// Runs `work` unless the session has to close first.
    ///
    /// `work` is dropped when an interrupt fires, abandoning any frame it was
    /// waiting to enqueue.
    async fn guard<T, F>(&mut self, work: F) -> Result<T, CloseReason>
    where
        F: Future<Output = Result<T, ChannelClosed>>,
    {
        tokio::select! {
            biased;
            reason = self.fired() => Err(reason),
            result = work => result.map_err(|ChannelClosed| CloseReason::WriteFailed),
        }
    }
}
