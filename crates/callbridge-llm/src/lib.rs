//! Token stream sources for callbridge.
//!
//! A [`TokenSource`] turns a prompt into a lazy, finite stream of text
//! fragments. The coordinator consumes one stream per reply and forwards
//! every fragment to the caller as soon as it arrives, so sources must not
//! buffer the whole response.
//!
//! Streams are not restartable. A failure is reported as an `Err` item and
//! the stream ends right after it.

pub mod error;
pub mod gemini;

use futures_util::Stream;
use std::pin::Pin;

pub use error::LlmError;
pub use gemini::{GeminiConfig, GeminiSource};

/// Boxed stream of generated text fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Upper bound on generated output length.
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Produces token streams for prompts.
///
/// `generate` must be cheap and must not perform I/O itself: all work happens
/// when the returned stream is first polled, so dropping an unpolled stream
/// costs nothing and dropping a partially consumed one cancels the request.
pub trait TokenSource: Send + Sync {
    fn generate(&self, request: GenerationRequest) -> TokenStream;
}
