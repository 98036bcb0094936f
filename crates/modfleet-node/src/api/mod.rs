//! HTTP API Module
//!
//! REST API endpoints for a modfleet node.
//!
//! This module contains:
//! - `state`: Shared application state
//! - `health`: Liveness and readiness probes
//! - `metrics`: Prometheus metrics endpoint
//! - `modules`: Hosted module table

mod health;
mod metrics;
mod modules;
mod state;

pub use state::AppState;

use axum::{routing::get, Router};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Observability
        .route("/metrics", get(metrics::get_metrics))
        // Node state
        .route("/modules", get(modules::get_modules))
        .with_state(state)
}
