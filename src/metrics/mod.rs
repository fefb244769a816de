//! Metrics module
//!
//! Prometheus metrics for client operations, registered in the default
//! registry. Exposing them is up to the embedding application.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "objput_uploads_total",
        "Total number of uploads",
        &["mode", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "objput_upload_bytes_total",
        "Total bytes uploaded, as sent on the wire"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "objput_upload_duration_seconds",
        "Upload duration in seconds",
        &["mode"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Read operations
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "objput_requests_total",
        "Non-upload requests by operation",
        &["operation", "status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "objput_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

fn status_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Record a successful upload
pub fn record_upload_success(mode: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[mode, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(mode: &str) {
    UPLOADS_TOTAL.with_label_values(&[mode, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(mode: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[mode])
        .observe(duration_secs);
}

/// Record a head/get/delete request
pub fn record_request(operation: &str, success: bool) {
    REQUESTS_TOTAL
        .with_label_values(&[operation, status_label(success)])
        .inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
