//! HTTP intake.
//!
//! - `GET /health`: liveness
//! - `GET /metrics`: Prometheus exposition
//! - `POST /api/consent`: register a consent request
//! - `POST /api/bridge/events`: ingress for events delivered by the bridge

mod handlers;

pub use handlers::{
    BridgeEventAccepted, ConsentProofDto, ConsentRecordDto, CreateConsentRequest, JobCreatedResponse,
    PeriodDto,
};

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ConsentConfig;
use crate::service::ConsentService;
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConsentService>,
    pub consent: Arc<ConsentConfig>,
    pub metrics: MetricsRegistry,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/api/consent", post(handlers::create_consent))
        .route("/api/bridge/events", post(handlers::receive_bridge_event))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
