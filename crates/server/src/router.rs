//! Operational endpoints served beside the relay listener: Prometheus scrape, liveness,
//! readiness and a backend health dump.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use relayer_core::{chain::BlockHeightState, metrics::MetricsCollector, upstream::HealthChecker};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct OpsState {
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthChecker>,
    pub block_height: BlockHeightState,
}

/// Router for the metrics listener.
pub fn metrics_router(state: OpsState) -> Router {
    Router::new().route("/metrics", get(handle_metrics)).with_state(state)
}

/// Router for the health listener.
pub fn health_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/backends", get(handle_backends))
        .with_state(state)
}

pub async fn handle_metrics(State(state): State<OpsState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], state.metrics.get_prometheus_metrics())
}

pub async fn handle_health(State(state): State<OpsState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "block_height": state.block_height.current_height(),
    }))
}

/// Not ready until the first block height has been observed; relays cannot be validated
/// against sessions before that.
pub async fn handle_ready(State(state): State<OpsState>) -> impl IntoResponse {
    let height = state.block_height.current_height();
    let unhealthy = state.health.get_all_health().values().filter(|h| !h.is_healthy()).count();

    let status = if height == 0 { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (
        status,
        Json(json!({
            "ready": height > 0,
            "block_height": height,
            "block_age_seconds": (height > 0).then(|| state.block_height.age_seconds()),
            "unhealthy_backends": unhealthy,
        })),
    )
}

pub async fn handle_backends(State(state): State<OpsState>) -> impl IntoResponse {
    let mut backends = Map::new();
    for (id, health) in state.health.get_all_health() {
        backends.insert(
            id,
            json!({
                "url": health.backend_url,
                "status": health.status.as_str(),
                "last_check": health.last_check.map(|t| t.to_rfc3339()),
                "last_error": health.last_error,
                "consecutive_failures": health.consecutive_failures,
                "consecutive_successes": health.consecutive_successes,
            }),
        );
    }
    Json(Value::Object(backends))
}
