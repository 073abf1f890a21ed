//! Shared types for the callbridge workspace.
//!
//! This crate holds the media-stream wire protocol spoken between the
//! telephony provider and the bridge, plus the transcript types recorded for
//! every call. It has no async or network dependencies so that every other
//! crate (and the integration tests) can depend on it cheaply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod protocol;

pub use protocol::{FrameError, InboundEvent, MediaChunk, OutboundFrame, StartMeta};

/// Who produced an utterance in a call transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The person on the phone.
    Caller,
    /// The bridge (opening line, generated replies, fallbacks).
    Agent,
}

impl Speaker {
    /// Returns the label used when rendering transcript lines into a prompt.
    pub fn label(self) -> &'static str {
        match self {
            Self::Caller => "Prospect",
            Self::Agent => "Agent",
        }
    }
}

/// One entry of a call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Append-only record of what was said during a call.
///
/// Entries are never edited or removed; the only mutation is [`Transcript::push`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    entries: Vec<Utterance>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an utterance stamped with the current time.
    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.entries.push(Utterance {
            speaker,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[Utterance] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the last `n` utterances in chronological order.
    pub fn recent(&self, n: usize) -> &[Utterance] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }
}
