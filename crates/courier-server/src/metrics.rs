//! Prometheus metrics for the relay.
//!
//! Instrumented through the `metrics` facade; the exporter serves scrapes
//! on its own listener so the relay port stays clean.

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const RELAY_ATTEMPTS_TOTAL: &str = "courier_relay_attempts_total";
    pub const REPLAYED_TOTAL: &str = "courier_replayed_total";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Register metric descriptions with the recorder.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Connections accepted since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Currently open connections");
    metrics::describe_counter!(
        names::RELAY_ATTEMPTS_TOTAL,
        "Relay attempts, labeled by delivered/queued outcome"
    );
    metrics::describe_counter!(
        names::REPLAYED_TOTAL,
        "Backlog messages replayed to (re)connecting users"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors, labeled by kind");

    info!("Metrics registered");
}

/// Serve Prometheus scrapes on `0.0.0.0:port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind or install.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Count relay attempts for one outcome (`"delivered"` or `"queued"`).
pub fn record_relayed(outcome: &str, count: u64) {
    if count > 0 {
        counter!(names::RELAY_ATTEMPTS_TOTAL, "outcome" => outcome.to_string()).increment(count);
    }
}

/// Count backlog messages replayed at connect time.
pub fn record_replayed(count: usize) {
    if count > 0 {
        counter!(names::REPLAYED_TOTAL).increment(count as u64);
    }
}

/// Count one error by kind.
pub fn record_error(kind: &str) {
    counter!(names::ERRORS_TOTAL, "type" => kind.to_string()).increment(1);
}

/// Holds the active-connections gauge up for one connection's lifetime.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Count the connection and raise the gauge until drop.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
