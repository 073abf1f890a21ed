//! Google Gemini streaming source (`streamGenerateContent` over SSE).

use crate::{GenerationRequest, LlmError, TokenSource, TokenStream};
use futures_util::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn default_model() -> String {
    "gemini-2.0-flash-exp".to_string()
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Overridable so tests can point the source at a local server.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            api_base: default_api_base(),
        }
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Token source backed by the Gemini generative language API.
#[derive(Debug, Clone)]
pub struct GeminiSource {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiSource {
    pub fn new(config: GeminiConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        )
    }
}

/// Builds the `streamGenerateContent` request body.
pub fn build_request_body(request: &GenerationRequest) -> serde_json::Value {
    serde_json::json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.prompt }],
        }],
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        },
    })
}

/// Extracts the text carried by one SSE `data:` payload.
///
/// Returns `Ok(None)` for chunks with no text (usage-only or finish chunks).
pub fn parse_chunk(data: &str) -> Result<Option<String>, LlmError> {
    let parsed: serde_json::Value =
        serde_json::from_str(data).map_err(|e| LlmError::Decode(e.to_string()))?;

    if let Some(error) = parsed.get("error") {
        return Err(LlmError::Status {
            status: error["code"].as_u64().unwrap_or(0) as u16,
            message: error["message"].as_str().unwrap_or("unknown error").to_string(),
        });
    }

    let mut text = String::new();
    if let Some(parts) = parsed["candidates"][0]["content"]["parts"].as_array() {
        for part in parts {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
        }
    }

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

impl TokenSource for GeminiSource {
    fn generate(&self, request: GenerationRequest) -> TokenStream {
        let builder = self
            .client
            .post(self.stream_url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&build_request_body(&request));
        let model = self.config.model.clone();

        Box::pin(async_stream::stream! {
            let mut es = match builder.eventsource() {
                Ok(es) => es,
                Err(e) => {
                    yield Err(LlmError::Request(e.to_string()));
                    return;
                }
            };

            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {
                        tracing::debug!(model = %model, "gemini stream opened");
                    }
                    Ok(Event::Message(msg)) => match parse_chunk(&msg.data) {
                        Ok(Some(text)) => yield Ok(text),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let message = response.text().await.unwrap_or_default();
                        yield Err(LlmError::Status {
                            status: status.as_u16(),
                            message,
                        });
                        break;
                    }
                    Err(e) => {
                        yield Err(LlmError::Stream(e.to_string()));
                        break;
                    }
                }
            }

            // The event source reconnects on its own unless closed.
            es.close();
        })
    }
}
