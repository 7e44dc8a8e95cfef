//! Health check endpoint.

use axum::{extract::State, Json};

use crate::protocol::HealthResponse;

/// GET /health - liveness check used by the orchestrator's registry
pub async fn health(State(state): State<super::AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.controller.uptime_secs(),
        operation: state.controller.describe().await,
    })
}
