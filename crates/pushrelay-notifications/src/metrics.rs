//! Metric emission for queueing and delivery.
//!
//! Uses the `metrics` facade; whichever recorder the host process installs receives the values.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::types::PushProvider;

/// Metric names as constants for consistency.
pub mod names {
    // Queue metrics
    pub const QUEUE_FLUSHES_TOTAL: &str = "push_notifications_queue_flushes_total";
    pub const QUEUE_SIZE_ON_FLUSH: &str = "push_notifications_queue_size_on_flush";
    pub const QUEUE_RESIDENCY_SECONDS: &str = "push_notifications_queue_residency_seconds";
    pub const BATCHES_ON_FLUSH: &str = "push_notifications_batches_on_flush";

    // Provider metrics
    pub const SEND_SUCCESS_TOTAL: &str = "push_notifications_send_success_total";
    pub const SEND_FAILURE_TOTAL: &str = "push_notifications_send_failure_total";
    pub const TRANSACTION_DURATION_SECONDS: &str =
        "push_notifications_transaction_duration_seconds";
    pub const DISPATCH_ERRORS_TOTAL: &str = "push_notifications_dispatch_errors_total";

    // Subscription cleanup metrics
    pub const INVALIDATION_REQUESTS_TOTAL: &str = "push_notifications_invalidation_requests_total";
    pub const INVALIDATION_FAILURES_TOTAL: &str = "push_notifications_invalidation_failures_total";
}

// =============================================================================
// Queue Metrics
// =============================================================================

pub fn record_flush(trigger: &'static str) {
    counter!(names::QUEUE_FLUSHES_TOTAL, "trigger" => trigger).increment(1);
}

/// Point-in-time size of the batch handed over on flush.
pub fn set_queue_size_on_flush(size: usize) {
    gauge!(names::QUEUE_SIZE_ON_FLUSH).set(size as f64);
}

pub fn set_batches_on_flush(batches: usize) {
    gauge!(names::BATCHES_ON_FLUSH).set(batches as f64);
}

pub fn record_queue_residency(residency_ms: f64) {
    histogram!(names::QUEUE_RESIDENCY_SECONDS).record(residency_ms / 1000.0);
}

// =============================================================================
// Provider Metrics
// =============================================================================

pub fn record_send_success(provider: PushProvider, count: usize) {
    counter!(names::SEND_SUCCESS_TOTAL, "provider" => provider.as_str()).increment(count as u64);
}

pub fn record_send_failure(provider: PushProvider, count: usize) {
    counter!(names::SEND_FAILURE_TOTAL, "provider" => provider.as_str()).increment(count as u64);
}

pub fn record_transaction(provider: PushProvider, duration: Duration) {
    histogram!(names::TRANSACTION_DURATION_SECONDS, "provider" => provider.as_str())
        .record(duration.as_secs_f64());
}

pub fn record_dispatch_error(provider: PushProvider) {
    counter!(names::DISPATCH_ERRORS_TOTAL, "provider" => provider.as_str()).increment(1);
}

// =============================================================================
// Subscription Cleanup Metrics
// =============================================================================

pub fn record_invalidation_request() {
    counter!(names::INVALIDATION_REQUESTS_TOTAL).increment(1);
}

pub fn record_invalidation_failure() {
    counter!(names::INVALIDATION_FAILURES_TOTAL).increment(1);
}
