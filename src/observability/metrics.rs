//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define drain metrics (connections, shutdown state, forced closes)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `drain_active_connections` (gauge): current open connection count
//! - `drain_connections_accepted_total` (counter)
//! - `drain_connections_forced_total` (counter): aborted at the deadline
//! - `drain_shutdown_state` (gauge): 0=running, 1=draining, 2=closed
//! - `drain_shutdown_duration_seconds` (histogram): trigger to closed, by outcome
//! - `drain_faults_total` (counter): faults reported through `on_drain_error`
//!
//! # Design Decisions
//! - Low-overhead metric updates via the `metrics` facade
//! - Recording is a no-op until `init_metrics` installs the exporter

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::lifecycle::ShutdownState;

/// Install the Prometheus exporter with its own HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_active_connections(open: usize) {
    ::metrics::gauge!("drain_active_connections").set(open as f64);
}

pub fn record_connection_accepted() {
    ::metrics::counter!("drain_connections_accepted_total").increment(1);
}

pub fn record_forced_closes(count: usize) {
    ::metrics::counter!("drain_connections_forced_total").increment(count as u64);
}

pub fn record_shutdown_state(state: ShutdownState) {
    let value = match state {
        ShutdownState::Running => 0.0,
        ShutdownState::Draining => 1.0,
        ShutdownState::Closed => 2.0,
    };
    ::metrics::gauge!("drain_shutdown_state").set(value);
}

pub fn record_shutdown_complete(outcome: &'static str, elapsed: Duration) {
    ::metrics::histogram!("drain_shutdown_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}

pub fn record_drain_fault() {
    ::metrics::counter!("drain_faults_total").increment(1);
}
