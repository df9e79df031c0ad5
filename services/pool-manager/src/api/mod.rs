//! HTTP status surface and routing.
//!
//! Read-only: handlers report the orchestrator's last published snapshot
//! and can query the directory, but never mutate pool state.

pub mod error;
mod health;
mod status;

use axum::{http::Method, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .merge(status::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
