use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref FRAMES_PROCESSED: IntCounter = register_int_counter!(
        "access_sentry_frames_processed_total",
        "Frames that went through the detection cascade"
    )
    .unwrap();
    pub static ref CYCLE_SECONDS: Histogram = register_histogram!(
        "access_sentry_cycle_seconds",
        "Wall clock time of one capture, inference and publish cycle",
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();
    pub static ref ACCESS_EVENTS: IntCounterVec = register_int_counter_vec!(
        "access_sentry_access_events_total",
        "Access events written, by status",
        &["status"]
    )
    .unwrap();
    pub static ref NOTIFICATIONS: IntCounterVec = register_int_counter_vec!(
        "access_sentry_notifications_total",
        "Unauthorized access notifications written, by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref SUPPRESSED_EVENTS: IntCounterVec = register_int_counter_vec!(
        "access_sentry_suppressed_events_total",
        "Attempts not logged because the subject was logged recently",
        &["subject"]
    )
    .unwrap();
    pub static ref STAGE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "access_sentry_stage_failures_total",
        "Non fatal failures of a pipeline stage",
        &["stage"]
    )
    .unwrap();
    pub static ref PIPELINE_RUNNING: IntGauge = register_int_gauge!(
        "access_sentry_pipeline_running",
        "1 while the detection loop is running"
    )
    .unwrap();
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
