//! Server configuration loading from file and environment variables.

use callbridge_llm::GeminiConfig;
use callbridge_telephony::TwilioConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Call-control credentials.
    #[serde(default)]
    pub twilio: TwilioConfig,

    /// Token source credentials and model.
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// What the bridge says and how replies are generated.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Media-stream limits.
    #[serde(default)]
    pub media: MediaConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL (e.g. `https://bridge.example.com`).
    ///
    /// Used to build the TwiML callback and media-stream URLs. When unset,
    /// they are derived from the request's `Host` header.
    #[serde(default)]
    pub public_url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "callbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// First utterance sent when a stream starts. `{name}` is replaced by the
    /// `name` stream parameter.
    #[serde(default = "default_opening_line")]
    pub opening_line: String,

    /// Sent when generation fails.
    #[serde(default = "default_fallback_line")]
    pub fallback_line: String,

    /// Instruction placed at the top of every generation prompt.
    #[serde(default = "default_instruction")]
    pub instruction: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Number of recent transcript entries included in the prompt.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,

    /// Longest wait for the next token before the generation counts as
    /// failed. `0` disables the limit.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Close a stream that sends nothing for this long. `0` disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Hard cap on a call's length. `0` disables.
    #[serde(default = "default_max_call_secs")]
    pub max_call_secs: u64,

    /// Outbound frames buffered per connection before token consumption
    /// waits for the socket.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

pub(crate) fn default_opening_line() -> String {
    "Hi {name}, quick question - do you have 30 seconds? I noticed restaurants in your area \
     making an extra $5K-15K monthly just by answering calls during rush hours. Are you leaving \
     money on the table right now?"
        .to_string()
}

pub(crate) fn default_fallback_line() -> String {
    "I understand. Tell me more about your situation.".to_string()
}

pub(crate) fn default_instruction() -> String {
    "Prospect said something. Respond naturally in 1-2 sentences.".to_string()
}

fn default_max_tokens() -> u32 {
    100
}

fn default_temperature() -> f32 {
    0.8
}

fn default_context_turns() -> usize {
    6
}

fn default_generation_timeout_secs() -> u64 {
    20
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_max_call_secs() -> u64 {
    3600
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            opening_line: default_opening_line(),
            fallback_line: default_fallback_line(),
            instruction: default_instruction(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_turns: default_context_turns(),
            generation_timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_call_secs: default_max_call_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// One or more provider credentials are not set.
    #[error("missing credentials: {}", .0.join(", "))]
    MissingCredentials(Vec<&'static str>),
}

impl Config {
    /// Names of the credentials that are still empty after loading.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.twilio.account_sid.is_empty() {
            missing.push("twilio.account_sid");
        }
        if self.twilio.auth_token.is_empty() {
            missing.push("twilio.auth_token");
        }
        if self.twilio.phone_number.is_empty() {
            missing.push("twilio.phone_number");
        }
        if self.gemini.api_key.is_empty() {
            missing.push("gemini.api_key");
        }
        missing
    }

    /// Fails with [`ConfigError::MissingCredentials`] unless every credential is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_credentials();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingCredentials(missing))
        }
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CALLBRIDGE_HOST` overrides `server.host`
/// - `CALLBRIDGE_PORT` overrides `server.port`
/// - `CALLBRIDGE_PUBLIC_URL` overrides `server.public_url`
/// - `CALLBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `CALLBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TWILIO_ACCOUNT_SID`, `TWILIO_AUTH_TOKEN`, `TWILIO_OUTBOUND_NUMBER`
///   override the `twilio` credentials
/// - `GEMINI_API_KEY` overrides `gemini.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies environment overrides using `lookup` to read variables.
pub(crate) fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("CALLBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("CALLBRIDGE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(url) = lookup("CALLBRIDGE_PUBLIC_URL") {
        if !url.trim().is_empty() {
            config.server.public_url = Some(url);
        }
    }
    if let Some(level) = lookup("CALLBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("CALLBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(sid) = lookup("TWILIO_ACCOUNT_SID") {
        config.twilio.account_sid = sid;
    }
    if let Some(token) = lookup("TWILIO_AUTH_TOKEN") {
        config.twilio.auth_token = token;
    }
    if let Some(number) = lookup("TWILIO_OUTBOUND_NUMBER") {
        config.twilio.phone_number = number;
    }
    if let Some(key) = lookup("GEMINI_API_KEY") {
        config.gemini.api_key = key;
    }
}
