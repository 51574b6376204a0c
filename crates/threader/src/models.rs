//! Core data models for the concurrency controller

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single host telemetry snapshot.
///
/// Fields that could not be measured are `None`, never zero. Percentages are
/// in `[0, 100]`, temperatures in degrees Celsius, timestamps in epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub ts: i64,
    pub cpu_usage: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub mem_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub gpu_temp: Option<f64>,
}

impl TelemetrySample {
    /// A sample with every field absent, for probes that failed entirely.
    pub fn empty(ts: i64) -> Self {
        Self {
            ts,
            cpu_usage: None,
            cpu_temp: None,
            mem_usage: None,
            gpu_usage: None,
            gpu_temp: None,
        }
    }
}

/// Mix of operation kinds currently in flight or queued, keyed by kind label.
///
/// Values are summed caller-supplied intensity weights for that kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMix(pub BTreeMap<String, f64>);

impl OperationMix {
    /// Total intensity across all kinds.
    pub fn total_intensity(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One performance observation, recorded each supervisor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfPoint {
    pub sample: TelemetrySample,
    /// Concurrency limit in force when the point was recorded.
    pub thread_count: u32,
    pub active_threads: u32,
    pub queue_pressure: usize,
    pub backlog: usize,
    /// `active_threads / max(limit, 1)`.
    pub utilization: f64,
    pub throughput: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub operation_mix: OperationMix,
    /// Mean caller-supplied intensity over in-flight work, in `[0, 1]`.
    pub intensity: f64,
}

/// Demand observation used for the exploration ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandPoint {
    pub ts: i64,
    pub queue_pressure: usize,
    pub active_threads: u32,
    pub utilization: f64,
    pub has_unmet_demand: bool,
    pub backlog: usize,
}

/// Snapshot of the admission queue, produced by the admission manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub limit: u32,
    pub active_threads: u32,
    pub queue_pressure: usize,
    /// `queued + active`; authoritative backlog figure.
    pub backlog: usize,
    /// Completions per second over the recent measurement window.
    pub throughput: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub operation_mix: OperationMix,
    /// Mean intensity over queued and active work, in `[0, 1]`.
    pub intensity: f64,
    pub total_operations: u64,
}

/// A change in the recommended concurrency limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub ts: i64,
    pub recommended_threads: u32,
    pub previous_threads: u32,
    pub reason: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Durable usage-history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub ts: i64,
    pub cpu_usage: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub gpu_temp: Option<f64>,
    pub concurrent_threads: u32,
    pub active_threads: u32,
    pub queue_pressure: usize,
    pub operation_mix: OperationMix,
    pub operation_intensity: f64,
}

/// Durable scaling-history row with the decision context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingRecord {
    pub ts: i64,
    pub thread_count: u32,
    pub cpu_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub temperature: Option<f64>,
    pub active_operations: u32,
    pub queue_length: usize,
    pub scaling_decision: String,
    pub pid_output: Option<f64>,
    pub bayes_optimization: Option<f64>,
    pub demand_score: Option<f64>,
}

/// Running per-kind resource averages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationProfile {
    pub operation_type: String,
    pub cpu_avg: f64,
    pub gpu_avg: f64,
    pub memory_avg: f64,
    pub temperature_avg: f64,
    pub duration_avg_ms: f64,
    pub count: u64,
    pub last_updated: i64,
}

impl OperationProfile {
    pub fn new(operation_type: impl Into<String>, ts: i64) -> Self {
        Self {
            operation_type: operation_type.into(),
            cpu_avg: 0.0,
            gpu_avg: 0.0,
            memory_avg: 0.0,
            temperature_avg: 0.0,
            duration_avg_ms: 0.0,
            count: 0,
            last_updated: ts,
        }
    }

    /// Fold one completed operation into the running averages.
    pub fn fold(
        &mut self,
        duration_ms: f64,
        cpu: Option<f64>,
        gpu: Option<f64>,
        memory: Option<f64>,
        temperature: Option<f64>,
        ts: i64,
    ) {
        let n = self.count as f64;
        let next = n + 1.0;
        self.duration_avg_ms = (self.duration_avg_ms * n + duration_ms) / next;
        if let Some(v) = cpu {
            self.cpu_avg = (self.cpu_avg * n + v) / next;
        }
        if let Some(v) = gpu {
            self.gpu_avg = (self.gpu_avg * n + v) / next;
        }
        if let Some(v) = memory {
            self.memory_avg = (self.memory_avg * n + v) / next;
        }
        if let Some(v) = temperature {
            self.temperature_avg = (self.temperature_avg * n + v) / next;
        }
        self.count += 1;
        self.last_updated = ts;
    }
}
