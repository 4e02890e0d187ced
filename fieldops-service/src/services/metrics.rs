//! Prometheus metrics for fieldops-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Status transition counter by entity kind and outcome.
pub static TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fieldops_transitions_total",
        "Total number of status transition requests",
        &["kind", "to", "outcome"] // applied, rejected, invalid
    )
    .expect("Failed to register transitions_total")
});

/// Conversion counter by direction and outcome.
pub static CONVERSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fieldops_conversions_total",
        "Total number of document conversions",
        &["direction", "outcome"] // created, existing, rejected
    )
    .expect("Failed to register conversions_total")
});

/// Webhook event counter by source and outcome.
pub static WEBHOOK_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fieldops_webhook_events_total",
        "Total number of webhook deliveries by outcome",
        &["source", "outcome"] // processed, failed, duplicate, in_flight
    )
    .expect("Failed to register webhook_events_total")
});

/// Customer notification counter by outcome.
pub static NOTIFICATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fieldops_notifications_total",
        "Total number of customer notifications",
        &["kind", "outcome"]
    )
    .expect("Failed to register notifications_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fieldops_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&TRANSITIONS_TOTAL);
    Lazy::force(&CONVERSIONS_TOTAL);
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&NOTIFICATIONS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
