//! Observability Module
//!
//! - `metrics`: Prometheus metrics for modules, registration and migration
//! - `events`: Structured event logging with consistent fields
//! - `tracing`: Subscriber setup (text or JSON)

pub mod events;
pub mod metrics;
pub mod tracing;

pub use metrics::{init_metrics, MetricsState};
pub use tracing::{init_tracing, TracingConfig};
