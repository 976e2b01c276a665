//! Prometheus metrics for the appliance client.
//!
//! The HTTP `/metrics` endpoint itself is hosted by the `csi-driver` binary;
//! this module only registers and updates the gauges/counters/histograms
//! that describe appliance connectivity and volume engine activity.

use std::time::Instant;

use metrics::{counter, gauge, histogram};

/// Metric names
pub mod names {
    /// Counter: total engine operations by kind and outcome
    pub const ENGINE_OPERATIONS_TOTAL: &str = "tns_csi_engine_operations_total";
    /// Histogram: duration of engine operations in seconds
    pub const ENGINE_OPERATION_DURATION_SECONDS: &str = "tns_csi_engine_operation_duration_seconds";
    /// Gauge: 1 if the appliance WebSocket connection is authenticated and ready, else 0
    pub const APPLIANCE_CONNECTED: &str = "tns_csi_appliance_connected";
    /// Counter: appliance reconnect attempts
    pub const APPLIANCE_RECONNECTS_TOTAL: &str = "tns_csi_appliance_reconnects_total";
    /// Counter: operations retried, by operation kind
    pub const RETRIES_TOTAL: &str = "tns_csi_retries_total";
    /// Gauge: in-flight JSON-RPC requests awaiting a response
    pub const INFLIGHT_REQUESTS: &str = "tns_csi_appliance_inflight_requests";
}

/// Records an engine operation outcome (`operation`, e.g. `"create_volume"`;
/// `status`, `"success"` or an error kind name).
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::ENGINE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::ENGINE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn set_appliance_connected(connected: bool) {
    gauge!(names::APPLIANCE_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

pub fn record_reconnect() {
    counter!(names::APPLIANCE_RECONNECTS_TOTAL).increment(1);
}

pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

pub fn set_inflight_requests(count: usize) {
    gauge!(names::INFLIGHT_REQUESTS).set(count as f64);
}

/// Helper for timing an engine operation end-to-end.
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    pub fn failure(self, error_kind: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_kind, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_timer_does_not_panic_without_recorder_installed() {
        let timer = OperationTimer::new("create_volume");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.success();
    }
}
