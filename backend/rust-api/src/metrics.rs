use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Job Queue Metrics
    pub static ref JOBS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "jobs_enqueued_total",
        "Total number of jobs enqueued",
        &["queue"]
    )
    .unwrap();

    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "jobs_processed_total",
        "Total number of job attempts by outcome (completed, retried, exhausted)",
        &["queue", "outcome"]
    )
    .unwrap();

    pub static ref JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "job_duration_seconds",
        "Job handler duration in seconds",
        &["queue"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    // Business Metrics
    pub static ref SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sessions_total",
        "Total number of problem sessions by status",
        &["status"]
    )
    .unwrap();

    pub static ref ANSWERS_SUBMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_submitted_total",
        "Total number of answers submitted",
        &["correct"]
    )
    .unwrap();

    pub static ref BADGES_AWARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "badges_awarded_total",
        "Total number of badges awarded",
        &["badge_type"]
    )
    .unwrap();

    // Notification Hub Metrics
    pub static ref HUB_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "hub_connections_active",
        "Number of active notification hub connections"
    )
    .unwrap();

    pub static ref HUB_EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hub_events_published_total",
        "Total number of hub events delivered to connections",
        &["event"]
    )
    .unwrap();

    pub static ref STATUS_POLLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "status_polls_total",
        "Total number of status poller runs by outcome",
        &["outcome"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: time one job attempt and count its outcome.
pub fn record_job_attempt(queue: &str, outcome: &str, duration_secs: f64) {
    JOBS_PROCESSED_TOTAL
        .with_label_values(&[queue, outcome])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[queue])
        .observe(duration_secs);
}
