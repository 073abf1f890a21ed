//! Callbridge server library.
//!
//! Exposes the application router and shared state so the binary and the
//! integration tests build the same service.

pub mod api;
pub mod api_media;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod registry;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Extension, Router,
};
use callbridge_llm::TokenSource;
use callbridge_telephony::CallGateway;
use coordinator::{Coordinator, SessionSettings};
use metrics::Metrics;
use registry::SessionRegistry;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Request bodies on the REST surface are tiny JSON or form payloads.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub registry: SessionRegistry,
    pub metrics: Arc<Metrics>,
    pub gateway: Arc<dyn CallGateway>,
    /// Externally reachable base URL, if configured.
    pub public_url: Option<String>,
    /// Capacity of each media stream's outbound queue.
    pub outbound_buffer: usize,
}

impl AppState {
    /// Builds state with a fresh registry and zeroed metrics.
    pub fn new(
        settings: SessionSettings,
        source: Arc<dyn TokenSource>,
        gateway: Arc<dyn CallGateway>,
    ) -> Self {
        let registry = SessionRegistry::new();
        let metrics = Arc::new(Metrics::new());
        let coordinator = Coordinator::new(registry.clone(), metrics.clone(), source, settings);
        Self {
            coordinator,
            registry,
            metrics,
            gateway,
            public_url: None,
            outbound_buffer: 256,
        }
    }

    pub fn with_public_url(mut self, public_url: Option<String>) -> Self {
        self.public_url = public_url;
        self
    }

    pub fn with_outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity.max(1);
        self
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::dashboard_handler))
        .route("/api/health", get(api::health_handler))
        .route("/api/metrics", get(api::metrics_handler))
        .route("/api/call/make", post(api::make_call_handler))
        .route("/api/calls", get(api::list_calls_handler))
        .route("/api/calls/{callSid}", delete(api::hangup_handler))
        .route(
            "/api/calls/{callSid}/conversion",
            post(api::conversion_handler),
        )
        .route("/twiml-media", post(api::twiml_media_handler))
        .route("/media-stream", get(api_media::media_stream_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
