//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{ClientRegistry, DeliveryObserver, DeliveryReport};
use relay_protocol::MessageType;
use relay_transport::{MessageStream, Received, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
    pub const ROSTER_SIZE: &str = "relay_roster_size";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Writes to a connection that failed or timed out"
    );
    metrics::describe_gauge!(names::ROSTER_SIZE, "Number of identified users");
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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record `count` messages totalling `bytes`.
pub fn record_messages(count: usize, bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(count as u64);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Update the roster size.
pub fn set_roster_size(count: usize) {
    gauge!(names::ROSTER_SIZE).set(count as f64);
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
        record_connection();
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
        record_disconnection();
    }
}

/// Records hub deliveries.
pub struct DeliveryMetrics {
    registry: Arc<ClientRegistry>,
}

impl DeliveryMetrics {
    /// Create an observer reading roster size from `registry`.
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }
}

impl DeliveryObserver for DeliveryMetrics {
    fn on_delivery(&self, report: &DeliveryReport) {
        if report.delivered > 0 {
            record_messages(report.delivered, report.delivered * report.bytes, "outbound");
        }
        if report.failed > 0 {
            counter!(names::DELIVERY_FAILURES_TOTAL).increment(report.failed as u64);
        }
        if report.message_type == MessageType::UserList {
            set_roster_size(self.registry.stats().identified_count);
        }
    }
}

/// Counts inbound messages and protocol errors of one connection.
pub struct MeteredStream {
    inner: Box<dyn MessageStream>,
}

impl MeteredStream {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn MessageStream>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MessageStream for MeteredStream {
    async fn recv_frame(&mut self) -> Result<Option<Received>, TransportError> {
        let result = self.inner.recv_frame().await;
        match &result {
            Ok(Some(received)) => record_messages(1, received.size, "inbound"),
            Ok(None) => {}
            Err(e) if e.is_protocol() => record_error("protocol"),
            Err(_) => record_error("transport"),
        }
        result
    }
}
