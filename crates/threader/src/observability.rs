//! Observability for the concurrency controller
//!
//! Prometheus metrics covering the admission queue and the scaling loop.
//! Logging uses `tracing` throughout; subscriber installation is left to
//! the embedding application.

use prometheus::{register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge};
use std::sync::OnceLock;

/// Histogram buckets for operation latency (in seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once).
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    concurrency_limit: IntGauge,
    active_operations: IntGauge,
    queued_operations: IntGauge,
    scaling_decisions: IntCounter,
    emergency_clamps: IntCounter,
    operations_completed: IntCounter,
    operations_failed: IntCounter,
    operation_latency_seconds: Histogram,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            concurrency_limit: register_int_gauge!(
                "llm_threader_concurrency_limit",
                "Current concurrency limit of the admission manager"
            )
            .expect("Failed to register concurrency_limit"),

            active_operations: register_int_gauge!(
                "llm_threader_active_operations",
                "Operations currently executing"
            )
            .expect("Failed to register active_operations"),

            queued_operations: register_int_gauge!(
                "llm_threader_queued_operations",
                "Operations waiting for admission"
            )
            .expect("Failed to register queued_operations"),

            scaling_decisions: register_int_counter!(
                "llm_threader_scaling_decisions_total",
                "Total limit changes applied"
            )
            .expect("Failed to register scaling_decisions"),

            emergency_clamps: register_int_counter!(
                "llm_threader_emergency_clamps_total",
                "Total emergency clamps to a single thread"
            )
            .expect("Failed to register emergency_clamps"),

            operations_completed: register_int_counter!(
                "llm_threader_operations_completed_total",
                "Operations that finished successfully"
            )
            .expect("Failed to register operations_completed"),

            operations_failed: register_int_counter!(
                "llm_threader_operations_failed_total",
                "Operations that failed, timed out or were canceled"
            )
            .expect("Failed to register operations_failed"),

            operation_latency_seconds: register_histogram!(
                "llm_threader_operation_latency_seconds",
                "Wall-clock latency of completed operations",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register operation_latency_seconds"),
        }
    }
}

/// Lightweight handle to the global controller metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn set_queue_gauges(&self, limit: i64, active: i64, queued: i64) {
        self.inner().concurrency_limit.set(limit);
        self.inner().active_operations.set(active);
        self.inner().queued_operations.set(queued);
    }

    pub fn inc_scaling_decision(&self) {
        self.inner().scaling_decisions.inc();
    }

    pub fn inc_emergency_clamp(&self) {
        self.inner().emergency_clamps.inc();
    }

    pub fn observe_completion(&self, latency_secs: f64, success: bool) {
        self.inner().operation_latency_seconds.observe(latency_secs);
        if success {
            self.inner().operations_completed.inc();
        } else {
            self.inner().operations_failed.inc();
        }
    }
}
