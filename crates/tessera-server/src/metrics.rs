//! Metrics collection and export for Tessera.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tessera_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tessera_connections_active";
    pub const ADMISSIONS_REJECTED: &str = "tessera_admissions_rejected_total";
    pub const EVENTS_ROUTED: &str = "tessera_events_routed_total";
    pub const PERMISSION_DENIED: &str = "tessera_permission_denied_total";
    pub const BROADCAST_FANOUT: &str = "tessera_broadcast_fanout";
    pub const EVICTIONS_TOTAL: &str = "tessera_evictions_total";
    pub const ROOMS_ACTIVE: &str = "tessera_rooms_active";
    pub const MESSAGES_BYTES: &str = "tessera_messages_bytes";
    pub const LATENCY_SECONDS: &str = "tessera_routing_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tessera_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::ADMISSIONS_REJECTED,
        "Handshakes rejected, by reason"
    );
    metrics::describe_counter!(names::EVENTS_ROUTED, "Client events routed, by event and outcome");
    metrics::describe_counter!(
        names::PERMISSION_DENIED,
        "Client events denied by the role gate"
    );
    metrics::describe_histogram!(
        names::BROADCAST_FANOUT,
        "Number of members reached per broadcast"
    );
    metrics::describe_counter!(names::EVICTIONS_TOTAL, "Connections evicted, by cause");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of open rooms");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event routing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a rejected handshake.
pub fn record_rejection(reason: &'static str) {
    counter!(names::ADMISSIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a routed event.
pub fn record_event(event: &'static str, outcome: &'static str) {
    counter!(names::EVENTS_ROUTED, "event" => event, "outcome" => outcome).increment(1);
}

/// Record a role-gate denial.
pub fn record_denial(event: &'static str) {
    counter!(names::PERMISSION_DENIED, "event" => event).increment(1);
}

/// Record a broadcast.
pub fn record_fanout(delivered: usize) {
    histogram!(names::BROADCAST_FANOUT).record(delivered as f64);
}

/// Record evicted connections.
pub fn record_evictions(count: usize, cause: &'static str) {
    if count > 0 {
        counter!(names::EVICTIONS_TOTAL, "cause" => cause).increment(count as u64);
    }
}

/// Update the open room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record routing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
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
