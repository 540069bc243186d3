//! Metrics module for subscription-service.
//! Provides Prometheus metrics for subscription lifecycle and quota decisions.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Store query duration histogram
pub static STORE_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_store_query_duration_seconds",
            "Subscription store query duration",
            vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
        ),
        &["operation"]
    )
    .expect("Failed to register STORE_QUERY_DURATION")
});

/// Subscription lifecycle operations counter
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage ledger operations counter
pub static USAGE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota decisions counter
pub static QUOTA_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_operations_total",
                "Total subscription lifecycle operations by type"
            ),
            &["operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    USAGE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_usage_operations_total",
                "Total usage ledger operations by feature and type"
            ),
            &["feature", "operation"]
        )
        .expect("Failed to register USAGE_OPERATIONS_TOTAL")
    });

    QUOTA_DECISIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_quota_decisions_total",
                "Total quota checks by feature and outcome"
            ),
            &["feature", "outcome"]
        )
        .expect("Failed to register QUOTA_DECISIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_errors_total", "Total errors by kind for alerting"),
            &["kind", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*STORE_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a subscription lifecycle operation.
pub fn record_subscription_operation(operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record a usage ledger operation.
pub fn record_usage_operation(feature: &str, operation: &str) {
    if let Some(counter) = USAGE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[feature, operation]).inc();
    }
}

/// Record the outcome of a quota check.
pub fn record_quota_decision(feature: &str, allowed: bool) {
    if let Some(counter) = QUOTA_DECISIONS_TOTAL.get() {
        let outcome = if allowed { "allowed" } else { "denied" };
        counter.with_label_values(&[feature, outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(kind: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[kind, operation]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_operations_are_exported() {
        init_metrics();
        init_metrics();
        record_subscription_operation("create");
        record_quota_decision("seats", false);

        let text = get_metrics();
        assert!(text.contains("subscription_operations_total"));
        assert!(text.contains("subscription_quota_decisions_total"));
    }
}
