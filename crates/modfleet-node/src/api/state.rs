//! Application State
//!
//! Shared state passed to all API handlers.

use crate::node::NodeHandle;
use crate::observability::MetricsState;

#[derive(Clone)]
pub struct AppState {
    pub node: NodeHandle,
    pub metrics_state: Option<MetricsState>,
}
