//! Media-stream wire protocol.
//!
//! Every WebSocket text frame is a JSON object with an `event` discriminator.
//! Inbound frames come from the telephony provider; outbound frames carry
//! text for the caller, base64-encoded in the `media.payload` field.
//!
//! Inbound decoding is done in two steps so that a `start` frame missing its
//! `callSid` can be told apart from a frame that is not JSON at all: the
//! first is fatal to channel setup, the second is simply discarded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while decoding a media-stream frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame is not a JSON object with an `event` field.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A `start` frame without a usable call identifier.
    #[error("invalid start event: {0}")]
    InvalidStart(String),

    /// A `media` frame whose payload is missing or not valid base64.
    #[error("invalid media event: {0}")]
    InvalidMedia(String),
}

/// Metadata carried by the `start` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    /// Call identifier assigned by the gateway.
    pub call_sid: String,
    /// Media-stream identifier, echoed back on outbound frames.
    #[serde(default)]
    pub stream_sid: Option<String>,
    /// `<Parameter>` values attached to the stream in the TwiML document.
    #[serde(default)]
    pub custom_parameters: BTreeMap<String, String>,
}

/// A decoded inbound audio chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    pub payload: Vec<u8>,
    pub track: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Start(StartMeta),
    Media(MediaChunk),
    Stop,
    /// Any other event kind (`connected`, `mark`, `dtmf`, ...).
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default, rename = "streamSid")]
    stream_sid: Option<String>,
    #[serde(default)]
    start: Option<serde_json::Value>,
    #[serde(default)]
    media: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawMedia {
    payload: String,
    #[serde(default)]
    track: Option<String>,
}

impl InboundEvent {
    /// Decodes one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Json`] for anything that is not an event envelope,
    /// [`FrameError::InvalidStart`] for a `start` event without a non-empty
    /// `callSid`, and [`FrameError::InvalidMedia`] for a `media` event whose
    /// payload cannot be decoded.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let envelope: Envelope = serde_json::from_str(text)?;

        match envelope.event.as_str() {
            "start" => {
                let raw = envelope
                    .start
                    .ok_or_else(|| FrameError::InvalidStart("missing start object".to_string()))?;
                let mut meta: StartMeta = serde_json::from_value(raw)
                    .map_err(|e| FrameError::InvalidStart(e.to_string()))?;
                if meta.call_sid.trim().is_empty() {
                    return Err(FrameError::InvalidStart("empty callSid".to_string()));
                }
                if meta.stream_sid.is_none() {
                    meta.stream_sid = envelope.stream_sid;
                }
                Ok(Self::Start(meta))
            }
            "media" => {
                let raw = envelope
                    .media
                    .ok_or_else(|| FrameError::InvalidMedia("missing media object".to_string()))?;
                let raw: RawMedia = serde_json::from_value(raw)
                    .map_err(|e| FrameError::InvalidMedia(e.to_string()))?;
                let payload = STANDARD
                    .decode(raw.payload.as_bytes())
                    .map_err(|e| FrameError::InvalidMedia(format!("payload is not base64: {}", e)))?;
                Ok(Self::Media(MediaChunk {
                    payload,
                    track: raw.track,
                }))
            }
            "stop" => Ok(Self::Stop),
            _ => Ok(Self::Other(envelope.event)),
        }
    }

    /// Returns the event discriminator as it appears on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Self::Start(_) => "start",
            Self::Media(_) => "media",
            Self::Stop => "stop",
            Self::Other(kind) => kind,
        }
    }
}

/// The `media` object of an outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64 of the UTF-8 bytes of the text.
    pub payload: String,
}

/// An outbound frame written back to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(
            rename = "streamSid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
}

impl OutboundFrame {
    /// Builds a media frame carrying `text`.
    pub fn text(stream_sid: Option<&str>, text: &str) -> Self {
        Self::Media {
            stream_sid: stream_sid.map(str::to_string),
            media: MediaPayload {
                payload: STANDARD.encode(text.as_bytes()),
            },
        }
    }

    /// Serializes the frame to its JSON wire form.
    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes the payload back into text.
    pub fn payload_text(&self) -> Result<String, FrameError> {
        let Self::Media { media, .. } = self;
        let bytes = STANDARD
            .decode(media.payload.as_bytes())
            .map_err(|e| FrameError::InvalidMedia(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| FrameError::InvalidMedia(e.to_string()))
    }
}
