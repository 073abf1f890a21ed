//! REST handlers: outbound calls, TwiML, metrics and call control.

use crate::metrics::MetricsSnapshot;
use crate::registry::ActiveCall;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use callbridge_telephony::{connect_stream_twiml, OutboundCall};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Errors returned by REST handlers, rendered as `{"error": ..}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Externally visible base URL: the configured one, else `https://{Host}`.
fn public_base(state: &AppState, headers: &HeaderMap) -> Result<Url, ApiError> {
    let raw = match &state.public_url {
        Some(url) => url.clone(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .filter(|h| !h.is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest("no public_url configured and no Host header".into())
                })?;
            format!("https://{}", host)
        }
    };

    let mut url = Url::parse(&raw)
        .map_err(|e| ApiError::InternalServerError(format!("invalid public url {}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn endpoint(base: &Url, path: &str) -> Result<Url, ApiError> {
    base.join(path)
        .map_err(|e| ApiError::InternalServerError(format!("failed to build url: {}", e)))
}

/// Handler for `GET /`.
pub async fn dashboard_handler() -> Html<&'static str> {
    Html(include_str!("dashboard.html"))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_calls: usize,
}

/// Handler for `GET /api/health`.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_calls: state.registry.len(),
    })
}

/// Handler for `GET /api/metrics`.
pub async fn metrics_handler(Extension(state): Extension<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot(state.registry.len()))
}

#[derive(Debug, Deserialize)]
pub struct MakeCallRequest {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MakeCallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handler for `POST /api/call/make`.
pub async fn make_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<MakeCallRequest>,
) -> Result<Response, ApiError> {
    let phone = payload
        .phone
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("phone is required".into()))?;

    let mut callback = endpoint(&public_base(&state, &headers)?, "twiml-media")?;
    if let Some(name) = payload.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        callback.query_pairs_mut().append_pair("name", name);
    }

    let call = OutboundCall {
        to: phone.to_string(),
        from: state.gateway.default_origin().to_string(),
        callback_url: callback.to_string(),
        record: true,
    };

    match state.gateway.initiate_call(&call).await {
        Ok(placed) => {
            state.metrics.record_call_initiated();
            tracing::info!(call_sid = %placed.sid, to = %call.to, "outbound call placed");
            Ok(Json(MakeCallResponse {
                success: true,
                call_sid: Some(placed.sid),
                status: placed.status,
                error: None,
            })
            .into_response())
        }
        Err(e) => {
            tracing::warn!(to = %call.to, error = %e, "failed to place outbound call");
            Ok((
                StatusCode::BAD_GATEWAY,
                Json(MakeCallResponse {
                    success: false,
                    call_sid: None,
                    status: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response())
        }
    }
}

/// Handler for `GET /api/calls`.
pub async fn list_calls_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<ActiveCall>> {
    Json(state.registry.snapshot())
}

/// Handler for `DELETE /api/calls/{callSid}`.
pub async fn hangup_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.registry.request_hangup(&call_sid) {
        return Err(ApiError::NotFound(format!("no active call {}", call_sid)));
    }
    tracing::info!(call_sid = %call_sid, "hangup requested");
    Ok(Json(serde_json::json!({
        "success": true,
        "call_sid": call_sid
    })))
}

/// Handler for `POST /api/calls/{callSid}/conversion`.
pub async fn conversion_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Json<serde_json::Value> {
    state.metrics.record_conversion();
    tracing::info!(call_sid = %call_sid, "conversion recorded");
    Json(serde_json::json!({
        "success": true,
        "conversions": state.metrics.snapshot(0).conversions
    }))
}

#[derive(Debug, Deserialize)]
pub struct TwimlQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// Handler for `POST /twiml-media`.
///
/// Called by the provider when an outbound call is answered. Points the call
/// at `/media-stream` on the same host, switching the scheme to `ws`/`wss`.
pub async fn twiml_media_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TwimlQuery>,
) -> Result<Response, ApiError> {
    let mut stream_url = endpoint(&public_base(&state, &headers)?, "media-stream")?;
    let scheme = if stream_url.scheme() == "http" { "ws" } else { "wss" };
    stream_url
        .set_scheme(scheme)
        .map_err(|()| ApiError::InternalServerError("cannot build stream url".into()))?;

    let name = query.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let parameters: Vec<(&str, &str)> = name.map(|n| ("name", n)).into_iter().collect();
    let xml = connect_stream_twiml(stream_url.as_str(), &parameters);

    Ok(([(header::CONTENT_TYPE, "application/xml")], xml).into_response())
}
