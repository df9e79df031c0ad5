//! Pool status endpoints.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tracing::debug;
use vpnpool_reconcile::Slot;

use super::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TestServersResponse {
    pub count: usize,
    pub servers: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/ports", get(ports))
        .route("/slots", get(slots))
        .route("/test-servers", get(test_servers))
}

async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        status: "ok",
        message: "VPN pool manager is running",
    })
}

/// Host ports of the active pool.
async fn ports(State(state): State<AppState>) -> Json<Vec<u16>> {
    Json(state.orchestrator().active_ports())
}

/// Active slots with their assigned endpoints.
async fn slots(State(state): State<AppState>) -> Json<Vec<Slot>> {
    let snapshot = state.orchestrator().active_slots();
    Json(snapshot.as_ref().clone())
}

/// Live passthrough query to the directory service.
async fn test_servers(State(state): State<AppState>) -> Result<Json<TestServersResponse>, ApiError> {
    let servers = state.directory().try_fetch_candidates().await?;
    debug!(count = servers.len(), "Directory test query");
    Ok(Json(TestServersResponse {
        count: servers.len(),
        servers,
    }))
}
