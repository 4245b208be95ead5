//! Prometheus metrics for admission decisions.
//!
//! Exposed on a dedicated listener (`METRICS_PORT`, default 9090).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `parse_gate_admissions_total` - Admitted requests (label: tier)
//! - `parse_gate_rejections_total` - Rejected requests (label: reason)
//! - `parse_gate_rate_limit_violations_total` - Rate-limit violations (label: app_id)
//! - `parse_gate_idempotency_duplicates_total` - Duplicate request ids (label: app_id)
//! - `parse_gate_reaped_records_total` - Expired records and sessions dropped (label: kind)
//!
//! ## Histograms
//! - `parse_gate_admission_duration_seconds` - Time spent in admission (label: outcome)
//!
//! ## Gauges
//! - `parse_gate_registered_apps` - Applications in the registry
//!
//! Recording before [`init_metrics`] is a no-op, so library users and tests
//! need no setup.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const ADMISSIONS_TOTAL: &str = "parse_gate_admissions_total";
    pub const REJECTIONS_TOTAL: &str = "parse_gate_rejections_total";
    pub const RATE_LIMIT_VIOLATIONS_TOTAL: &str = "parse_gate_rate_limit_violations_total";
    pub const IDEMPOTENCY_DUPLICATES_TOTAL: &str = "parse_gate_idempotency_duplicates_total";
    pub const REAPED_RECORDS_TOTAL: &str = "parse_gate_reaped_records_total";
    pub const ADMISSION_DURATION_SECONDS: &str = "parse_gate_admission_duration_seconds";
    pub const REGISTERED_APPS: &str = "parse_gate_registered_apps";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::ADMISSIONS_TOTAL, "Requests that passed admission");
    describe_counter!(names::REJECTIONS_TOTAL, "Requests rejected during admission");
    describe_counter!(
        names::RATE_LIMIT_VIOLATIONS_TOTAL,
        "Requests rejected by a rate-limit rule"
    );
    describe_counter!(
        names::IDEMPOTENCY_DUPLICATES_TOTAL,
        "Requests rejected as duplicates of an earlier request id"
    );
    describe_counter!(
        names::REAPED_RECORDS_TOTAL,
        "Expired idempotency records and sessions removed by the reaper"
    );
    describe_histogram!(
        names::ADMISSION_DURATION_SECONDS,
        "Time spent deciding admission, in seconds"
    );
    describe_gauge!(names::REGISTERED_APPS, "Number of registered applications");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Like [`init_metrics`], but logs failures instead of returning them.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_admission(tier: &'static str, elapsed: Duration) {
    counter!(names::ADMISSIONS_TOTAL, "tier" => tier).increment(1);
    histogram!(names::ADMISSION_DURATION_SECONDS, "outcome" => "admitted")
        .record(elapsed.as_secs_f64());
}

pub fn record_rejection(reason: &'static str, elapsed: Duration) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
    histogram!(names::ADMISSION_DURATION_SECONDS, "outcome" => "rejected")
        .record(elapsed.as_secs_f64());
}

pub fn record_rate_limit_violation(app_id: &str) {
    counter!(names::RATE_LIMIT_VIOLATIONS_TOTAL, "app_id" => app_id.to_string()).increment(1);
}

pub fn record_idempotency_duplicate(app_id: &str) {
    counter!(names::IDEMPOTENCY_DUPLICATES_TOTAL, "app_id" => app_id.to_string()).increment(1);
}

pub fn record_reaped(kind: &'static str, count: usize) {
    counter!(names::REAPED_RECORDS_TOTAL, "kind" => kind).increment(count as u64);
}

pub fn set_registered_apps(count: usize) {
    gauge!(names::REGISTERED_APPS).set(count as f64);
}
