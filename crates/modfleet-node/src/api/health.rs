//! Health Check Endpoints
//!
//! Liveness and readiness probe handlers.

use super::state::AppState;
use axum::{extract::State, http::StatusCode};

/// Liveness probe. Fails once the node control loop has stopped.
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.node.is_running() {
        Ok("OK")
    } else {
        tracing::warn!("Node control loop is not running");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Readiness probe. Returns OK once the node is registered with its realm.
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.node.is_registered() {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
