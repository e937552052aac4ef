//! Health and metrics endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use ingest::ConsumerState;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;

/// Shared state for the ops endpoints.
#[derive(Clone)]
pub struct OpsState {
    pub consumer: watch::Receiver<ConsumerState>,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub consumer: String,
}

/// GET /health: 200 while the consumer is running, 503 otherwise.
pub async fn health(State(state): State<OpsState>) -> (StatusCode, Json<HealthResponse>) {
    let consumer = *state.consumer.borrow();
    let (status, label) = match consumer {
        ConsumerState::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            consumer: consumer.to_string(),
        }),
    )
}

/// GET /metrics: Prometheus text format.
pub async fn metrics(State(state): State<OpsState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
