//! Public controller facade
//!
//! Wires the telemetry source, history, decision engine, admission manager
//! and supervisor together behind the `execute`/`initialize`/`shutdown`
//! surface.

use crate::admission::{AdmissionManager, AdmissionState, CompletionHandle, SubmitOptions};
use crate::config::ControllerConfig;
use crate::engine::{DecisionEngine, EngineState};
use crate::error::TaskError;
use crate::history::{HistoryStats, HistoryStore};
use crate::models::{OperationProfile, QueueSnapshot, ScalingRecord, TelemetrySample};
use crate::persist::{open_store, Retention, ScalingStore};
use crate::supervisor::Supervisor;
use crate::telemetry::{create_source, TelemetrySource};
use crate::trend::{self, TrendRecommendation};
use anyhow::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Window handed to the trend view, in seconds.
const TREND_WINDOW_SEC: u64 = 60;

type ScalingCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Combined introspection view.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub admission: AdmissionState,
    pub scaling: EngineState,
    pub queue_stats: QueueSnapshot,
}

/// Builder for a [`Controller`] with non-default collaborators.
pub struct ControllerBuilder {
    config: ControllerConfig,
    source: Option<Arc<dyn TelemetrySource>>,
    store: Option<Arc<dyn ScalingStore>>,
    on_scaling_update: Option<ScalingCallback>,
}

impl ControllerBuilder {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            source: None,
            store: None,
            on_scaling_update: None,
        }
    }

    /// Replace the host probe (tests, embedded platforms).
    pub fn source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the durable store.
    pub fn store(mut self, store: Arc<dyn ScalingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Observe effective limit changes as `(new, old)`.
    pub fn on_scaling_update(mut self, callback: ScalingCallback) -> Self {
        self.on_scaling_update = Some(callback);
        self
    }

    pub fn build(self) -> Controller {
        let config = self.config;
        let retention = Retention {
            usage_max_age_ms: (config.max_history_age_minutes * 60 * 1000) as i64,
            scaling_max_age_ms: (config.scaling_history_retention_hours * 3_600_000.0) as i64,
        };

        let history = Arc::new(HistoryStore::new(
            config.max_history_age_minutes,
            config.max_data_points,
            config.max_performance_history,
        ));
        let store = self
            .store
            .unwrap_or_else(|| Arc::from(open_store(config.persistence_enabled, retention)));
        let source = self.source.unwrap_or_else(create_source);

        let initial_limit = 1;
        let admission =
            AdmissionManager::new(initial_limit, config.max_history_size, self.on_scaling_update);
        let engine = Arc::new(Mutex::new(DecisionEngine::new(
            config.clone(),
            Arc::clone(&history),
            Arc::clone(&store),
            initial_limit,
        )));
        let supervisor = Supervisor::new(
            config.clone(),
            Arc::clone(&source),
            Arc::clone(&history),
            Arc::clone(&engine),
            Arc::clone(&admission),
            Arc::clone(&store),
        );

        Controller {
            config,
            history,
            store,
            admission,
            engine,
            supervisor: tokio::sync::Mutex::new(supervisor),
        }
    }
}

/// Adaptive concurrency controller for expensive host-local operations.
pub struct Controller {
    config: ControllerConfig,
    history: Arc<HistoryStore>,
    store: Arc<dyn ScalingStore>,
    admission: Arc<AdmissionManager>,
    engine: Arc<Mutex<DecisionEngine>>,
    supervisor: tokio::sync::Mutex<Supervisor>,
}

impl Controller {
    /// Controller with the default host probe and store.
    pub fn new(config: ControllerConfig) -> Self {
        ControllerBuilder::new(config).build()
    }

    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    /// Start the monitoring loop. Idempotent.
    pub async fn initialize(&self) {
        self.supervisor.lock().await.start();
    }

    /// Stop the monitoring loop. Idempotent; in-flight operations continue.
    pub async fn shutdown(&self) {
        self.supervisor.lock().await.stop().await;
    }

    /// Submit an operation and receive its eventual result.
    pub fn execute<F, T>(&self, op: F, opts: SubmitOptions) -> CompletionHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.admission.submit(op, opts)
    }

    /// Await an operation's result directly.
    pub async fn run<F, T>(&self, op: F, opts: SubmitOptions) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute(op, opts).await
    }

    /// Combined admission/scaling/queue view.
    pub fn state(&self) -> ControllerState {
        ControllerState {
            admission: self.admission.state(),
            scaling: self.engine.lock().expect("engine mutex poisoned").state(),
            queue_stats: self.admission.queue_stats(),
        }
    }

    /// All retained telemetry samples.
    pub fn usage_history(&self) -> Vec<TelemetrySample> {
        self.history.all()
    }

    /// Aggregate statistics over the telemetry ring.
    pub fn usage_statistics(&self) -> HistoryStats {
        self.history.stats()
    }

    /// The current trend reading over recent telemetry.
    pub fn usage_trends(&self) -> TrendRecommendation {
        trend::recommendation(
            &self.history.recent(TREND_WINDOW_SEC),
            &self.config.high_thresholds,
        )
    }

    /// Durable scaling decisions, oldest first.
    pub fn scaling_history(&self) -> Vec<ScalingRecord> {
        self.store.scaling_history()
    }

    /// Per-kind operation profiles.
    pub fn operation_profiles(&self) -> Vec<OperationProfile> {
        self.store.operation_profiles()
    }
}
