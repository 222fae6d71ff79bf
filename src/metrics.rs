//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: port 9090).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Completed requests (labels: method, status)
//! - `gateway_rate_limited_total` - Requests rejected with 429
//! - `gateway_timeouts_total` - Requests answered with 504 by the timeout stage
//! - `gateway_panics_recovered_total` - Panics turned into 500 responses
//! - `gateway_upstream_errors_total` - Backend failures (label: kind)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `gateway_rate_limit_tracked_ips` - Client IPs currently holding a bucket
//!
//! All recording functions are no-ops until [`init_metrics`] installs the
//! exporter, so stages call them unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const TIMEOUTS_TOTAL: &str = "gateway_timeouts_total";
    pub const PANICS_RECOVERED_TOTAL: &str = "gateway_panics_recovered_total";
    pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const TRACKED_IPS: &str = "gateway_rate_limit_tracked_ips";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g., the port is
/// taken or a recorder is already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Total number of completed requests");
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the per-IP rate limiter"
    );
    describe_counter!(
        names::TIMEOUTS_TOTAL,
        "Total number of requests answered with 504 by the timeout stage"
    );
    describe_counter!(
        names::PANICS_RECOVERED_TOTAL,
        "Total number of panics recovered into 500 responses"
    );
    describe_counter!(
        names::UPSTREAM_ERRORS_TOTAL,
        "Total number of failed backend requests"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::TRACKED_IPS,
        "Number of client IPs currently tracked by the rate limiter"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record a completed request and its duration.
pub fn record_request(method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::REQUESTS_TOTAL, "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status)
        .record(duration_secs);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_timeout() {
    counter!(names::TIMEOUTS_TOTAL).increment(1);
}

pub fn record_panic_recovered() {
    counter!(names::PANICS_RECOVERED_TOTAL).increment(1);
}

/// Record a backend failure. `kind` is the error kind (e.g., "bad_gateway").
pub fn record_upstream_error(kind: &'static str) {
    counter!(names::UPSTREAM_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Update the tracked-IP gauge.
pub fn set_tracked_ips(count: usize) {
    gauge!(names::TRACKED_IPS).set(count as f64);
}
