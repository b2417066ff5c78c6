//! Prometheus metrics for the interceptor pipeline.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gatekeep_admission_rejections_total` - Requests not admitted (label: mode)
//! - `gatekeep_deadline_expirations_total` - Requests answered with 504
//! - `gatekeep_access_log_failures_total` - Log records a sink failed to write
//!
//! ## Histograms
//! - `gatekeep_request_duration_seconds` - Request duration (labels: method, status)
//!
//! Recording functions are no-ops until [`init_metrics`] installs the
//! exporter, so unit tests can exercise every interceptor without one.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const ADMISSION_REJECTIONS_TOTAL: &str = "gatekeep_admission_rejections_total";
    pub const DEADLINE_EXPIRATIONS_TOTAL: &str = "gatekeep_deadline_expirations_total";
    pub const ACCESS_LOG_FAILURES_TOTAL: &str = "gatekeep_access_log_failures_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gatekeep_request_duration_seconds";
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (port in use,
/// recorder already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::ADMISSION_REJECTIONS_TOTAL,
        "Total number of requests rejected by admission control"
    );
    describe_counter!(
        names::DEADLINE_EXPIRATIONS_TOTAL,
        "Total number of requests that exceeded their deadline"
    );
    describe_counter!(
        names::ACCESS_LOG_FAILURES_TOTAL,
        "Total number of access log records dropped by a failing sink"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds as observed by the completion logger"
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

pub fn record_admission_rejection(mode: &'static str) {
    counter!(names::ADMISSION_REJECTIONS_TOTAL, "mode" => mode).increment(1);
}

pub fn record_deadline_expired() {
    counter!(names::DEADLINE_EXPIRATIONS_TOTAL).increment(1);
}

pub fn record_access_log_failure() {
    counter!(names::ACCESS_LOG_FAILURES_TOTAL).increment(1);
}

/// Record the duration of one request.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}
