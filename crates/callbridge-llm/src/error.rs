use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("request error: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),
}
