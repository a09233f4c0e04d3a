/// Metrics and telemetry for calsync
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Sync runs, durations and event churn per provider
/// - Token refresh outcomes
/// - Webhook notifications
/// - Conflict scans
/// - Background task execution

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use tracing::error;

lazy_static! {
    // ========== Sync Metrics ==========

    /// Sync runs by provider and outcome (synced, error, reauth, skipped, timeout)
    pub static ref SYNC_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "calsync_sync_runs_total",
        "Total number of account sync runs",
        &["provider", "outcome"]
    )
    .expect("sync runs metric");

    /// Sync run duration in seconds
    pub static ref SYNC_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "calsync_sync_duration_seconds",
        "Account sync run duration in seconds",
        &["provider"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("sync duration metric");

    /// Events written by provider and change kind (upserted, removed)
    pub static ref EVENTS_CHANGED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "calsync_events_changed_total",
        "Total number of event rows changed by sync",
        &["provider", "change"]
    )
    .expect("events changed metric");

    /// Token refreshes by provider and outcome
    pub static ref TOKEN_REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "calsync_token_refreshes_total",
        "Total number of OAuth token refresh attempts",
        &["provider", "outcome"]
    )
    .expect("token refresh metric");

    // ========== Webhook Metrics ==========

    /// Push notifications by provider and result
    pub static ref WEBHOOK_NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "calsync_webhook_notifications_total",
        "Total number of provider push notifications received",
        &["provider", "result"]
    )
    .expect("webhook metric");

    // ========== Conflict Metrics ==========

    pub static ref CONFLICT_SCANS_TOTAL: IntCounter = register_int_counter!(
        "calsync_conflict_scans_total",
        "Total number of conflict scans"
    )
    .expect("conflict scan metric");

    /// Conflict flags written by severity
    pub static ref CONFLICT_FLAGS_WRITTEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "calsync_conflict_flags_written_total",
        "Total number of conflict flags created or updated",
        &["severity"]
    )
    .expect("conflict flag metric");

    // ========== Background Job Metrics ==========

    /// Background task executions by task type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "calsync_background_jobs_total",
        "Total number of background task executions",
        &["job_type", "status"]
    )
    .expect("background job metric");

    /// Background task duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "calsync_background_job_duration_seconds",
        "Background task execution time in seconds",
        &["job_type"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("background job duration metric");
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished sync run
pub fn record_sync_run(provider: &str, outcome: &str, duration: f64) {
    SYNC_RUNS_TOTAL.with_label_values(&[provider, outcome]).inc();
    SYNC_DURATION_SECONDS
        .with_label_values(&[provider])
        .observe(duration);
}

pub fn record_events_changed(provider: &str, upserted: u64, removed: u64) {
    EVENTS_CHANGED_TOTAL
        .with_label_values(&[provider, "upserted"])
        .inc_by(upserted);
    EVENTS_CHANGED_TOTAL
        .with_label_values(&[provider, "removed"])
        .inc_by(removed);
}

pub fn record_token_refresh(provider: &str, outcome: &str) {
    TOKEN_REFRESHES_TOTAL
        .with_label_values(&[provider, outcome])
        .inc();
}

pub fn record_webhook(provider: &str, result: &str) {
    WEBHOOK_NOTIFICATIONS_TOTAL
        .with_label_values(&[provider, result])
        .inc();
}

pub fn record_conflict_scan(flags_written: &[&str]) {
    CONFLICT_SCANS_TOTAL.inc();
    for severity in flags_written {
        CONFLICT_FLAGS_WRITTEN_TOTAL
            .with_label_values(&[severity])
            .inc();
    }
}

/// Record a background task execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}
