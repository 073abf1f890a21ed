use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelephonyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected request (HTTP {status}, code {code:?}): {message}")]
    Provider {
        status: u16,
        code: Option<u64>,
        message: String,
    },

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
