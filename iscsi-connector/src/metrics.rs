//! Prometheus metrics for the connector
//!
//! Provides metrics for monitoring attach/detach operations, portal logins
//! and device discovery.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of connector operations by type and status
    pub const OPERATIONS_TOTAL: &str = "iscsi_connector_operations_total";
    /// Histogram: Duration of connector operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "iscsi_connector_operation_duration_seconds";
    /// Counter: Portal login attempts by outcome
    pub const PORTAL_LOGINS_TOTAL: &str = "iscsi_connector_portal_logins_total";
    /// Counter: Block devices discovered by the scanner
    pub const DEVICES_DISCOVERED_TOTAL: &str = "iscsi_connector_devices_discovered_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a connector operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record the outcome of establishing one portal session
pub fn record_portal_login(success: bool) {
    counter!(names::PORTAL_LOGINS_TOTAL, "success" => success.to_string()).increment(1);
}

pub fn record_device_discovered() {
    counter!(names::DEVICES_DISCOVERED_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}
