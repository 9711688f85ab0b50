//! Prometheus metrics for the state store, event log and notifications
//!
//! Provides observability into:
//! - State transitions by target state
//! - Claim conflicts
//! - Store operation latencies and errors
//! - Event log writes and notification publishes

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Once;
use tracing::info;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// State transitions by target state
    pub static ref STATE_TRANSITIONS: CounterVec = CounterVec::new(
        Opts::new("flowstate_state_transitions_total", "State transitions written to the state store"),
        &["state"]
    ).unwrap();

    /// Claims rejected because the payload was already in flight
    pub static ref CLAIM_CONFLICTS_TOTAL: Counter = Counter::new(
        "flowstate_claim_conflicts_total",
        "Claims rejected because the payload was already claimed or processing"
    ).unwrap();

    /// Store operation latency
    pub static ref STORE_OP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("flowstate_store_operation_seconds", "Store operation duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation", "store_type"]
    ).unwrap();

    /// Store operation errors
    pub static ref STORE_OP_ERRORS: CounterVec = CounterVec::new(
        Opts::new("flowstate_store_errors_total", "Store operation errors"),
        &["operation", "store_type", "error_type"]
    ).unwrap();

    /// Event log writes by outcome
    pub static ref EVENT_LOG_WRITES: CounterVec = CounterVec::new(
        Opts::new("flowstate_event_log_writes_total", "Event log writes"),
        &["outcome"]
    ).unwrap();

    /// Notification publishes by outcome
    pub static ref NOTIFICATIONS_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("flowstate_notifications_total", "Workflow event notifications"),
        &["event_type", "outcome"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry
pub fn register_metrics() {
    INIT.call_once(|| {
        info!("Registering flowstate metrics");

        REGISTRY.register(Box::new(STATE_TRANSITIONS.clone())).ok();
        REGISTRY.register(Box::new(CLAIM_CONFLICTS_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(STORE_OP_DURATION.clone())).ok();
        REGISTRY.register(Box::new(STORE_OP_ERRORS.clone())).ok();
        REGISTRY.register(Box::new(EVENT_LOG_WRITES.clone())).ok();
        REGISTRY.register(Box::new(NOTIFICATIONS_PUBLISHED.clone())).ok();

        info!("flowstate metrics registered");
    });
}

/// Helper to time a store operation
pub struct OperationTimer {
    operation: &'static str,
    store_type: &'static str,
    start: std::time::Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str, store_type: &'static str) -> Self {
        Self {
            operation,
            store_type,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        STORE_OP_DURATION
            .with_label_values(&[self.operation, self.store_type])
            .observe(duration);
    }
}

/// Record a state transition
pub fn record_transition(state: &str) {
    STATE_TRANSITIONS.with_label_values(&[state]).inc();
}

/// Record a rejected claim
pub fn record_claim_conflict() {
    CLAIM_CONFLICTS_TOTAL.inc();
}

/// Record a store error
pub fn record_store_error(operation: &str, store_type: &str, error_type: &str) {
    STORE_OP_ERRORS
        .with_label_values(&[operation, store_type, error_type])
        .inc();
}

/// Record an event log write outcome (`recorded`, `skipped`, `failed`)
pub fn record_event_log_write(outcome: &str) {
    EVENT_LOG_WRITES.with_label_values(&[outcome]).inc();
}

/// Record a notification publish outcome
pub fn record_notification(event_type: &str, success: bool) {
    NOTIFICATIONS_PUBLISHED
        .with_label_values(&[event_type, if success { "published" } else { "failed" }])
        .inc();
}

/// Get metrics as text for Prometheus scraping
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        register_metrics();
        // Should not panic on duplicate registration
        register_metrics();
    }

    #[test]
    fn test_gather_includes_recorded_series() {
        register_metrics();

        record_transition("COMPLETED");
        record_claim_conflict();
        record_store_error("claim", "sqlite", "database");
        record_event_log_write("recorded");
        record_notification("SUCCEEDED", true);
        {
            let _timer = OperationTimer::new("get", "sqlite");
        }

        let text = gather_metrics();
        assert!(text.contains("flowstate_state_transitions_total"));
        assert!(text.contains("flowstate_claim_conflicts_total"));
        assert!(text.contains("flowstate_notifications_total"));
    }
}
