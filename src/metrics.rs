//! Prometheus metrics for the request pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`),
//! separate from the application port. Recording functions are safe to call
//! before or without [`init_metrics`]; the `metrics` facade drops them.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `omnibus_requests_total` - Finished requests (labels: outcome, status)
//! - `omnibus_rate_limited_total` - Requests rejected by the rate limiter
//! - `omnibus_timeouts_total` - Requests that lost the deadline race
//!
//! ## Histograms
//! - `omnibus_request_duration_seconds` - Time spent in the pipeline (labels: outcome)
//!
//! ## Gauges
//! - `omnibus_tracked_clients` - Buckets held by the counter store
//! - `omnibus_deadline_timers_armed` - Deadline timers currently armed

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::error::{AppError, AppResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "omnibus_requests_total";
    pub const RATE_LIMITED_TOTAL: &str = "omnibus_rate_limited_total";
    pub const TIMEOUTS_TOTAL: &str = "omnibus_timeouts_total";
    pub const REQUEST_DURATION_SECONDS: &str = "omnibus_request_duration_seconds";
    pub const TRACKED_CLIENTS: &str = "omnibus_tracked_clients";
    pub const DEADLINE_TIMERS_ARMED: &str = "omnibus_deadline_timers_armed";
}

/// Initialize the Prometheus metrics exporter.
///
/// This sets up metric descriptions and starts the Prometheus HTTP listener
/// on the specified address.
///
/// # Errors
///
/// Returns `AppError::Metrics` if a recorder is already installed or the
/// listener cannot be started.
pub fn init_metrics(metrics_addr: SocketAddr) -> AppResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| AppError::Metrics(format!("Failed to install Prometheus exporter: {e}")))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests that left the pipeline"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::TIMEOUTS_TOTAL,
        "Total number of requests that exceeded their deadline"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Time from admission to response in seconds"
    );

    describe_gauge!(
        names::TRACKED_CLIENTS,
        "Number of client buckets held by the rate limiter"
    );
    describe_gauge!(
        names::DEADLINE_TIMERS_ARMED,
        "Number of deadline timers currently armed"
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
// Counter Recording Functions
// =============================================================================

/// Record a finished request.
pub fn record_request(outcome: &'static str, status: u16) {
    counter!(names::REQUESTS_TOTAL, "outcome" => outcome, "status" => status.to_string())
        .increment(1);
}

/// Record a rate limit rejection.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

/// Record a lost deadline race.
pub fn record_timeout() {
    counter!(names::TIMEOUTS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record time spent in the pipeline.
pub fn record_request_duration(outcome: &'static str, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update the tracked clients gauge.
pub fn set_tracked_clients(count: usize) {
    gauge!(names::TRACKED_CLIENTS).set(count as f64);
}

/// A deadline timer was armed.
pub fn timer_armed() {
    gauge!(names::DEADLINE_TIMERS_ARMED).increment(1.0);
}

/// A deadline timer was released.
pub fn timer_released() {
    gauge!(names::DEADLINE_TIMERS_ARMED).decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the functions don't panic without an installed recorder.

    #[test]
    fn test_record_request() {
        record_request("completed", 200);
        record_request("rejected", 429);
    }

    #[test]
    fn test_record_rejections_and_timeouts() {
        record_rate_limited();
        record_timeout();
    }

    #[test]
    fn test_record_request_duration() {
        record_request_duration("completed", 0.1);
    }

    #[test]
    fn test_gauges() {
        set_tracked_clients(42);
        timer_armed();
        timer_released();
    }
}
