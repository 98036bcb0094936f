//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `modfleet_modules_running` - gauge of modules with a live execution context
//! - `modfleet_modules_started_total` - counter of execution contexts spawned
//! - `modfleet_modules_finished_total` - counter of completions
//! - `modfleet_registration_attempts_total` - counter of registration publishes
//! - `modfleet_control_messages_total` - counter of decoded control messages by kind
//! - `modfleet_messages_dropped_total` - counter of dropped messages by reason
//! - `modfleet_migrations_total` - counter of dispatched migrations
//! - `modfleet_migration_duration_seconds` - histogram of quit-to-dispatch time
//! - `modfleet_migration_arrival_seconds` - histogram of dispatch-to-arrival time

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// State containing the Prometheus handle for metrics export
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    describe_gauge!(
        "modfleet_modules_running",
        "Number of modules with a live execution context"
    );
    describe_counter!(
        "modfleet_modules_started_total",
        "Total number of execution contexts spawned"
    );
    describe_counter!(
        "modfleet_modules_finished_total",
        "Total number of module completions"
    );
    describe_counter!(
        "modfleet_registration_attempts_total",
        "Total number of registration requests published"
    );
    describe_counter!(
        "modfleet_control_messages_total",
        "Total number of control messages handled by kind"
    );
    describe_counter!(
        "modfleet_messages_dropped_total",
        "Total number of inbound messages dropped by reason"
    );
    describe_counter!(
        "modfleet_migrations_total",
        "Total number of migrations dispatched"
    );
    describe_histogram!(
        "modfleet_migration_duration_seconds",
        "Time from quit signal to migration dispatch in seconds"
    );
    describe_histogram!(
        "modfleet_migration_arrival_seconds",
        "Time from migration dispatch to arrival at the destination in seconds"
    );
}

pub fn record_module_started() {
    counter!("modfleet_modules_started_total").increment(1);
    gauge!("modfleet_modules_running").increment(1.0);
}

pub fn record_module_finished() {
    counter!("modfleet_modules_finished_total").increment(1);
    gauge!("modfleet_modules_running").decrement(1.0);
}

pub fn record_registration_attempt() {
    counter!("modfleet_registration_attempts_total").increment(1);
}

pub fn record_control_message(kind: &'static str) {
    counter!("modfleet_control_messages_total", "kind" => kind).increment(1);
}

pub fn record_message_dropped(reason: &'static str) {
    counter!("modfleet_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn record_migration(duration: Duration) {
    counter!("modfleet_migrations_total").increment(1);
    histogram!("modfleet_migration_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_migration_arrival(latency: Duration) {
    histogram!("modfleet_migration_arrival_seconds").record(latency.as_secs_f64());
}
