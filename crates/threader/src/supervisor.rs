//! Monitoring supervisor
//!
//! Drives the control loop: each tick samples telemetry, snapshots the
//! queue, records history, asks the engine for a recommendation and pushes
//! limit changes into the admission manager. Ticks are single-flight and a
//! failing tick never stops the loop.

use crate::admission::AdmissionManager;
use crate::config::ControllerConfig;
use crate::engine::DecisionEngine;
use crate::history::HistoryStore;
use crate::models::{PerfPoint, ScalingDecision, UsageRecord};
use crate::persist::ScalingStore;
use crate::telemetry::TelemetrySource;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Ticks between retention passes over the durable store.
const PRUNE_EVERY_TICKS: u64 = 60;

/// One tick's work, separated from the ticker for testability.
pub(crate) struct TickRunner {
    pub(crate) source: Arc<dyn TelemetrySource>,
    pub(crate) history: Arc<HistoryStore>,
    pub(crate) engine: Arc<Mutex<DecisionEngine>>,
    pub(crate) admission: Arc<AdmissionManager>,
    pub(crate) store: Arc<dyn ScalingStore>,
    pub(crate) tick_count: u64,
}

impl TickRunner {
    /// Sample, record, decide, apply. Errors are reported, never propagated
    /// into the ticker.
    pub(crate) async fn run_cycle(&mut self) -> Result<ScalingDecision> {
        let sample = self.source.sample().await;
        let queue = self.admission.queue_stats();
        let now_ms = sample.ts;

        self.history.append_sample(sample.clone());
        let point = PerfPoint {
            sample: sample.clone(),
            thread_count: queue.limit,
            active_threads: queue.active_threads,
            queue_pressure: queue.queue_pressure,
            backlog: queue.backlog,
            utilization: queue.active_threads as f64 / queue.limit.max(1) as f64,
            throughput: queue.throughput,
            avg_latency_ms: queue.avg_latency_ms,
            p95_latency_ms: queue.p95_latency_ms,
            operation_mix: queue.operation_mix.clone(),
            intensity: queue.intensity,
        };
        self.history.append_perf(point.clone());

        let mut decision = {
            let mut engine = self.engine.lock().expect("engine mutex poisoned");
            engine.record(&point);
            engine.decide(now_ms, &queue)
        };

        if decision.recommended_threads < 1 {
            warn!(
                recommended = decision.recommended_threads,
                "Engine produced an invalid recommendation, applying safety fallback"
            );
            decision = ScalingDecision {
                ts: now_ms,
                recommended_threads: 1,
                previous_threads: decision.previous_threads,
                reason: "fallback_safety".to_string(),
                confidence: 0.5,
            };
        }

        if decision.recommended_threads != self.admission.limit() {
            self.admission.update_limit(decision.recommended_threads);
        }

        self.store.record_usage(&UsageRecord {
            ts: now_ms,
            cpu_usage: sample.cpu_usage,
            cpu_temp: sample.cpu_temp,
            memory_usage: sample.mem_usage,
            gpu_usage: sample.gpu_usage,
            gpu_temp: sample.gpu_temp,
            concurrent_threads: queue.limit,
            active_threads: queue.active_threads,
            queue_pressure: queue.queue_pressure,
            operation_mix: queue.operation_mix.clone(),
            operation_intensity: queue.intensity,
        });
        for completion in self.admission.take_profile_backlog() {
            self.store.record_operation(
                &completion.kind,
                completion.duration_ms,
                sample.cpu_usage,
                sample.gpu_usage,
                sample.mem_usage,
                sample.cpu_temp,
                now_ms,
            );
        }

        self.tick_count += 1;
        if self.tick_count % PRUNE_EVERY_TICKS == 0 {
            self.store.prune(now_ms);
        }

        Ok(decision)
    }
}

/// Owns the periodic monitoring task. Start and stop are idempotent.
pub struct Supervisor {
    config: ControllerConfig,
    source: Arc<dyn TelemetrySource>,
    history: Arc<HistoryStore>,
    engine: Arc<Mutex<DecisionEngine>>,
    admission: Arc<AdmissionManager>,
    store: Arc<dyn ScalingStore>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn TelemetrySource>,
        history: Arc<HistoryStore>,
        engine: Arc<Mutex<DecisionEngine>>,
        admission: Arc<AdmissionManager>,
        store: Arc<dyn ScalingStore>,
    ) -> Self {
        Self {
            config,
            source,
            history,
            engine,
            admission,
            store,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Start the monitoring ticker. A second call is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            debug!("Supervisor already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let interval_ms = self.config.monitoring_interval_ms.max(1);
        let mut runner = TickRunner {
            source: Arc::clone(&self.source),
            history: Arc::clone(&self.history),
            engine: Arc::clone(&self.engine),
            admission: Arc::clone(&self.admission),
            store: Arc::clone(&self.store),
            tick_count: 0,
        };

        info!(interval_ms, "Starting monitoring supervisor");
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            // Ticks are awaited inline; anything missed meanwhile is dropped.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = shutdown_rx;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = runner.run_cycle().await {
                            warn!(error = %e, "Monitoring tick failed, continuing");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Shutting down monitoring supervisor");
                        break;
                    }
                }
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
    }

    /// Stop the ticker and wait for it to wind down. Idempotent.
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}
