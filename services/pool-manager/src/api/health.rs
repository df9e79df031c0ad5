//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Active slots versus capacity.
    pub pool: PoolHealth,
}

#[derive(Debug, Serialize)]
pub struct PoolHealth {
    pub active: usize,
    pub capacity: usize,
    pub cycle_in_progress: bool,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

/// Service liveness plus a summary of the last published pool.
///
/// A pool below capacity reports "degraded" but still returns 200: the
/// monitor loop is responsible for repairing it.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.orchestrator();
    let active = orchestrator.active_slots().len();
    let capacity = orchestrator.capacity();

    Json(HealthResponse {
        status: if active == capacity { "ok" } else { "degraded" }.to_string(),
        service: "pool-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        pool: PoolHealth {
            active,
            capacity,
            cycle_in_progress: orchestrator.is_cycle_in_progress(),
        },
    })
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
