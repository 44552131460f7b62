//! Prometheus metrics
//!
//! The operational surface consumed by the dashboard: queue depths,
//! per-provider breaker and limiter state, sync outcomes and durations,
//! webhook counters.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Gauge: sync queue depth
    pub static ref SYNC_QUEUE_DEPTH: Gauge = register_gauge!(
        "ledgersync_sync_queue_depth",
        "Current number of pending sync jobs"
    )
    .expect("Failed to create sync_queue_depth metric");

    /// Gauge: age of the oldest pending sync job (seconds)
    pub static ref SYNC_QUEUE_OLDEST_AGE: Gauge = register_gauge!(
        "ledgersync_sync_queue_oldest_age_seconds",
        "Age of the oldest pending sync job"
    )
    .expect("Failed to create sync_queue_oldest_age metric");

    /// Gauge: webhook queue depth
    pub static ref WEBHOOK_QUEUE_DEPTH: Gauge = register_gauge!(
        "ledgersync_webhook_queue_depth",
        "Current number of buffered webhook events"
    )
    .expect("Failed to create webhook_queue_depth metric");

    /// Gauge: breaker state per provider (0 = closed, 1 = half-open, 2 = open)
    pub static ref BREAKER_STATE: GaugeVec = register_gauge_vec!(
        "ledgersync_breaker_state",
        "Circuit breaker state per provider (0 closed, 1 half-open, 2 open)",
        &["provider"]
    )
    .expect("Failed to create breaker_state metric");

    /// Gauge: consecutive breaker failures per provider
    pub static ref BREAKER_FAILURES: GaugeVec = register_gauge_vec!(
        "ledgersync_breaker_consecutive_failures",
        "Consecutive transient failures per provider",
        &["provider"]
    )
    .expect("Failed to create breaker_failures metric");

    /// Gauge: rate limiter tokens remaining per provider
    pub static ref LIMITER_REMAINING: GaugeVec = register_gauge_vec!(
        "ledgersync_limiter_remaining_tokens",
        "Rate limiter tokens remaining in the current window",
        &["provider"]
    )
    .expect("Failed to create limiter_remaining metric");

    /// Counter: sync outcomes by provider and result
    pub static ref SYNC_OUTCOMES: CounterVec = register_counter_vec!(
        "ledgersync_sync_outcomes_total",
        "Sync job outcomes by provider and result",
        &["provider", "outcome"]
    )
    .expect("Failed to create sync_outcomes metric");

    /// Histogram: provider call duration (seconds)
    pub static ref SYNC_DURATION: HistogramVec = register_histogram_vec!(
        "ledgersync_sync_duration_seconds",
        "Duration of provider sync calls",
        &["provider"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to create sync_duration metric");

    /// Counter: webhook events received per provider
    pub static ref WEBHOOKS_RECEIVED: CounterVec = register_counter_vec!(
        "ledgersync_webhooks_received_total",
        "Webhook events accepted per provider",
        &["provider"]
    )
    .expect("Failed to create webhooks_received metric");

    /// Counter: webhook processing outcomes
    pub static ref WEBHOOK_OUTCOMES: CounterVec = register_counter_vec!(
        "ledgersync_webhook_outcomes_total",
        "Webhook processing outcomes by provider and result",
        &["provider", "outcome"]
    )
    .expect("Failed to create webhook_outcomes metric");

    /// Gauge: daemon health status (1 = healthy, 0 = shutting down)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "ledgersync_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Set sync queue depth
pub fn set_sync_queue_depth(depth: i64) {
    SYNC_QUEUE_DEPTH.set(depth as f64);
}

/// Set age of oldest pending sync job
pub fn set_sync_queue_oldest_age(age_secs: f64) {
    SYNC_QUEUE_OLDEST_AGE.set(age_secs);
}

/// Set webhook queue depth
pub fn set_webhook_queue_depth(depth: i64) {
    WEBHOOK_QUEUE_DEPTH.set(depth as f64);
}

/// Set breaker state gauge for a provider
pub fn set_breaker_state(provider: &str, state: i64) {
    BREAKER_STATE.with_label_values(&[provider]).set(state as f64);
}

/// Set consecutive breaker failures for a provider
pub fn set_breaker_failures(provider: &str, failures: i64) {
    BREAKER_FAILURES
        .with_label_values(&[provider])
        .set(failures as f64);
}

/// Set remaining limiter tokens for a provider
pub fn set_limiter_remaining(provider: &str, remaining: i64) {
    LIMITER_REMAINING
        .with_label_values(&[provider])
        .set(remaining as f64);
}

/// Record a sync outcome (succeeded / failed / retried / deferred)
pub fn record_sync_outcome(provider: &str, outcome: &str) {
    SYNC_OUTCOMES.with_label_values(&[provider, outcome]).inc();
}

/// Record a provider call duration
pub fn record_sync_duration(provider: &str, duration_secs: f64) {
    SYNC_DURATION
        .with_label_values(&[provider])
        .observe(duration_secs);
}

/// Record an accepted webhook event
pub fn record_webhook_received(provider: &str) {
    WEBHOOKS_RECEIVED.with_label_values(&[provider]).inc();
}

/// Record a webhook processing outcome
pub fn record_webhook_outcome(provider: &str, outcome: &str) {
    WEBHOOK_OUTCOMES
        .with_label_values(&[provider, outcome])
        .inc();
}

/// Set daemon health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
