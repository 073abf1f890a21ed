use crate::config::TwilioConfig;
use crate::error::TelephonyError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Parameters for placing an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    /// Destination number (E.164).
    pub to: String,
    /// Caller ID (E.164).
    pub from: String,
    /// URL the provider fetches for call instructions once the call connects.
    pub callback_url: String,
    pub record: bool,
}

/// A call accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlacedCall {
    pub sid: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Places outbound calls.
#[async_trait]
pub trait CallGateway: Send + Sync {
    async fn initiate_call(&self, call: &OutboundCall) -> Result<PlacedCall, TelephonyError>;

    /// Caller ID to use when the request does not specify one.
    fn default_origin(&self) -> &str;
}

#[derive(Deserialize)]
struct ProviderError {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

/// Twilio REST client for the Calls resource.
#[derive(Debug)]
pub struct TwilioGateway {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioGateway {
    pub fn new(config: TwilioConfig) -> Result<Self, TelephonyError> {
        if config.account_sid.is_empty() {
            return Err(TelephonyError::Config("account_sid is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { config, client })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Calls.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl CallGateway for TwilioGateway {
    async fn initiate_call(&self, call: &OutboundCall) -> Result<PlacedCall, TelephonyError> {
        let record = if call.record { "true" } else { "false" };
        let params = [
            ("To", call.to.as_str()),
            ("From", call.from.as_str()),
            ("Url", call.callback_url.as_str()),
            ("Record", record),
        ];

        let response = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, message) = match serde_json::from_str::<ProviderError>(&body) {
                Ok(err) => (err.code, err.message.unwrap_or(body)),
                Err(_) => (None, body),
            };
            tracing::warn!(
                status = status.as_u16(),
                code = ?code,
                to = %call.to,
                "outbound call rejected by provider"
            );
            return Err(TelephonyError::Provider {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let placed: PlacedCall = response
            .json()
            .await
            .map_err(|e| TelephonyError::Decode(e.to_string()))?;

        tracing::info!(call_sid = %placed.sid, to = %call.to, "outbound call placed");
        Ok(placed)
    }

    fn default_origin(&self) -> &str {
        &self.config.phone_number
    }
}
