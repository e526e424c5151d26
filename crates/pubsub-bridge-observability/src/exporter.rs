//! HTTP exporter for the bridge metrics.
//!
//! - `GET /metrics`: Prometheus text format.
//! - `GET /health`: `200` while the bridge is starting or running, `503` once
//!   it is stopping or stopped, so an orchestrator can tell a draining bridge
//!   apart from a live one.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::{COORDINATOR_STATE, REGISTRY};

/// Gauge values at or above this mean the bridge is shutting down.
const STATE_STOPPING: i64 = 2;

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> Response {
    match COORDINATOR_STATE.get() {
        state if state >= STATE_STOPPING => {
            (StatusCode::SERVICE_UNAVAILABLE, "stopping").into_response()
        }
        0 => (StatusCode::OK, "starting").into_response(),
        _ => (StatusCode::OK, "running").into_response(),
    }
}

/// Router serving `/metrics` and `/health`.
pub fn create_metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
}
