//! Module Table Endpoint
//!
//! Exposes the node's hosted modules at GET /modules

use super::AppState;
use crate::orchestrator::NodeSnapshot;
use axum::{extract::State, http::StatusCode, Json};

/// GET /modules - snapshot of registration state and hosted modules
#[tracing::instrument(skip(state))]
pub async fn get_modules(State(state): State<AppState>) -> Result<Json<NodeSnapshot>, StatusCode> {
    match state.node.snapshot().await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to get node snapshot");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
