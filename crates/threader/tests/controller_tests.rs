//! End-to-end scenarios for the adaptive concurrency controller

use llm_threader::admission::{AdmissionManager, SubmitOptions};
use llm_threader::config::ControllerConfig;
use llm_threader::engine::DecisionEngine;
use llm_threader::history::HistoryStore;
use llm_threader::models::{OperationMix, PerfPoint, TelemetrySample};
use llm_threader::persist::{InMemoryScalingStore, Retention, ScalingStore};
use llm_threader::supervisor::Supervisor;
use llm_threader::telemetry::{async_trait, TelemetrySource};
use llm_threader::{CancellationToken, Controller, TaskError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Probe with externally adjustable readings.
struct FakeSource {
    cpu: Mutex<f64>,
    temp: Mutex<f64>,
}

impl FakeSource {
    fn new(cpu: f64, temp: f64) -> Arc<Self> {
        Arc::new(Self {
            cpu: Mutex::new(cpu),
            temp: Mutex::new(temp),
        })
    }

    fn set_temp(&self, temp: f64) {
        *self.temp.lock().unwrap() = temp;
    }
}

#[async_trait]
impl TelemetrySource for FakeSource {
    async fn sample(&self) -> TelemetrySample {
        TelemetrySample {
            ts: chrono::Utc::now().timestamp_millis(),
            cpu_usage: Some(*self.cpu.lock().unwrap()),
            cpu_temp: Some(*self.temp.lock().unwrap()),
            mem_usage: Some(40.0),
            gpu_usage: None,
            gpu_temp: None,
        }
    }
}

fn retention() -> Retention {
    Retention {
        usage_max_age_ms: 5 * 60 * 1000,
        scaling_max_age_ms: 20 * 60 * 1000,
    }
}

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        monitoring_interval_ms: 200,
        ..ControllerConfig::default()
    }
}

/// Controller plus collaborators wired for supervisor-level scenarios,
/// starting at an arbitrary limit.
struct Harness {
    admission: Arc<AdmissionManager>,
    supervisor: Supervisor,
    updates: Arc<Mutex<Vec<(u32, u32)>>>,
}

fn harness(initial_limit: u32, source: Arc<dyn TelemetrySource>) -> Harness {
    let config = fast_config();
    let history = Arc::new(HistoryStore::new(
        config.max_history_age_minutes,
        config.max_data_points,
        config.max_performance_history,
    ));
    let store: Arc<dyn ScalingStore> = Arc::new(InMemoryScalingStore::new(retention()));
    let updates = Arc::new(Mutex::new(Vec::new()));
    let admission = AdmissionManager::new(
        initial_limit,
        config.max_history_size,
        Some(Arc::new({
            let updates = Arc::clone(&updates);
            move |new, old| updates.lock().unwrap().push((new, old))
        })),
    );
    let engine = Arc::new(Mutex::new(DecisionEngine::new(
        config.clone(),
        Arc::clone(&history),
        Arc::clone(&store),
        initial_limit,
    )));
    let supervisor = Supervisor::new(
        config,
        source,
        history,
        engine,
        Arc::clone(&admission),
        store,
    );
    Harness {
        admission,
        supervisor,
        updates,
    }
}

fn never_completing(mgr: &Arc<AdmissionManager>, count: usize) -> CancellationToken {
    let gate = CancellationToken::new();
    for _ in 0..count {
        let gate = gate.clone();
        let _handle = mgr.submit(
            async move {
                gate.cancelled().await;
                Ok(())
            },
            SubmitOptions::default(),
        );
    }
    gate
}

#[tokio::test]
async fn thermal_emergency_clamps_to_one() {
    let source = FakeSource::new(50.0, 96.0);
    let mut h = harness(1, source);
    let gate = never_completing(&h.admission, 8);
    // let dispatch settle before the loop starts
    sleep(Duration::from_millis(20)).await;

    h.supervisor.start();
    sleep(Duration::from_millis(700)).await; // ~3 ticks at 200ms
    h.supervisor.stop().await;

    let state = h.admission.state();
    assert!(state.active <= 1, "active {} exceeds clamp", state.active);
    assert_eq!(state.limit, 1);
    assert_eq!(state.queued + state.active as usize, 8);
    gate.cancel();
}

#[tokio::test]
async fn deferred_scale_down_applies_on_drain() {
    let source = FakeSource::new(50.0, 60.0);
    let mut h = harness(4, Arc::clone(&source) as Arc<dyn TelemetrySource>);

    // four sleeping operations fill the limit
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(h.admission.submit(
            async {
                sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            SubmitOptions::default(),
        ));
    }
    sleep(Duration::from_millis(20)).await;
    assert_eq!(h.admission.state().active, 4);

    // emergency heat makes the engine demand a clamp to 1
    source.set_temp(96.0);
    h.supervisor.start();
    sleep(Duration::from_millis(300)).await;

    // the clamp arrived while work was active: deferred, not applied
    let state = h.admission.state();
    assert_eq!(state.limit, 4);
    assert_eq!(state.desired_limit, Some(1));
    assert!(h.updates.lock().unwrap().is_empty());

    for handle in handles {
        handle.await.unwrap();
    }
    sleep(Duration::from_millis(50)).await;
    h.supervisor.stop().await;

    let state = h.admission.state();
    assert_eq!(state.limit, 1);
    assert_eq!(state.desired_limit, None);
    let updates = h.updates.lock().unwrap();
    assert_eq!(updates.iter().filter(|(new, _)| *new == 1).count(), 1);
    assert!(updates.contains(&(1, 4)));
}

#[tokio::test]
async fn emergency_bypass_overtakes_without_scaling_update() {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let controller = Controller::builder(fast_config())
        .source(FakeSource::new(40.0, 55.0))
        .on_scaling_update(Arc::new({
            let updates = Arc::clone(&updates);
            move |new, old| updates.lock().unwrap().push((new, old))
        }))
        .build();

    // occupy the single slot with a non-emergency operation
    let gate = CancellationToken::new();
    let blocker_gate = gate.clone();
    let blocker = controller.execute(
        async move {
            blocker_gate.cancelled().await;
            Ok(())
        },
        SubmitOptions::default(),
    );
    sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.state().admission.active, 1);

    // the emergency starts immediately through the bypass
    let started = Arc::new(AtomicU32::new(0));
    let started_flag = Arc::clone(&started);
    let urgent = controller.execute(
        async move {
            started_flag.store(1, Ordering::SeqCst);
            Ok("rescued")
        },
        SubmitOptions {
            priority: 10,
            emergency: true,
            ..Default::default()
        },
    );
    assert_eq!(urgent.await.unwrap(), "rescued");
    assert_eq!(started.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(20)).await;
    let state = controller.state();
    assert_eq!(state.admission.limit, 1);
    assert!(!state.admission.emergency_bypass_active);
    // the transient raise is invisible to the scaling callback
    assert!(updates.lock().unwrap().is_empty());

    gate.cancel();
    blocker.await.unwrap();
}

#[tokio::test]
async fn optimal_ceiling_locks_in_efficient_level() {
    let config = ControllerConfig::default();
    let history = Arc::new(HistoryStore::new(5, 300, 200));
    let store: Arc<dyn ScalingStore> = Arc::new(InMemoryScalingStore::new(retention()));
    let mut engine = DecisionEngine::new(config, Arc::clone(&history), store, 2);

    let mut feed = |ts: i64, threads: u32, throughput: f64, latency_ms: f64| {
        let point = PerfPoint {
            sample: TelemetrySample {
                ts,
                cpu_usage: Some(50.0),
                cpu_temp: Some(60.0),
                mem_usage: Some(40.0),
                gpu_usage: None,
                gpu_temp: None,
            },
            thread_count: threads,
            active_threads: threads,
            queue_pressure: 0,
            backlog: threads as usize,
            utilization: 1.0,
            throughput: Some(throughput),
            avg_latency_ms: Some(latency_ms),
            p95_latency_ms: None,
            operation_mix: OperationMix::default(),
            intensity: 0.0,
        };
        history.append_perf(point.clone());
        engine.record(&point);
    };

    for i in 0..10 {
        feed(i * 1000, 2, 20.0, 50.0);
    }
    for i in 10..20 {
        feed(i * 1000, 4, 25.0, 120.0);
    }

    assert_eq!(engine.state().optimal_threads, Some(2));
}

#[tokio::test]
async fn scale_up_held_during_validation_window() {
    let source = FakeSource::new(50.0, 60.0);
    let mut h = harness(2, source);
    let gate = never_completing(&h.admission, 8);

    h.supervisor.start();
    sleep(Duration::from_millis(900)).await; // several ticks of unmet demand
    h.supervisor.stop().await;

    // one step was granted; the next is held until the validation resolves
    assert_eq!(h.admission.limit(), 3);
    gate.cancel();
}

#[tokio::test]
async fn timeout_surfaces_and_queue_drains() {
    let controller = Controller::builder(fast_config())
        .source(FakeSource::new(40.0, 55.0))
        .build();

    let started = std::time::Instant::now();
    let result = controller
        .run(
            async {
                sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            SubmitOptions {
                timeout_ms: Some(50),
                ..Default::default()
            },
        )
        .await;

    let elapsed = started.elapsed();
    assert!(matches!(result, Err(TaskError::Timeout { timeout_ms: 50 })));
    assert!(elapsed < Duration::from_millis(150), "took {elapsed:?}");

    sleep(Duration::from_millis(30)).await;
    let state = controller.state();
    assert_eq!(state.admission.active, 0);
    assert_eq!(state.admission.queued, 0);
}

#[tokio::test]
async fn cancellation_token_fails_queued_request() {
    let controller = Controller::builder(fast_config())
        .source(FakeSource::new(40.0, 55.0))
        .build();

    let gate = CancellationToken::new();
    let blocker_gate = gate.clone();
    let blocker = controller.execute(
        async move {
            blocker_gate.cancelled().await;
            Ok(())
        },
        SubmitOptions::default(),
    );
    sleep(Duration::from_millis(20)).await;

    let cancel = CancellationToken::new();
    let queued = controller.execute(
        async { Ok(()) },
        SubmitOptions {
            cancel_token: Some(cancel.clone()),
            ..Default::default()
        },
    );
    cancel.cancel();
    assert!(matches!(queued.await, Err(TaskError::Canceled)));

    gate.cancel();
    blocker.await.unwrap();
}

#[tokio::test]
async fn mixed_priorities_dispatch_in_order() {
    let controller = Controller::builder(fast_config())
        .source(FakeSource::new(40.0, 55.0))
        .build();

    let gate = CancellationToken::new();
    let blocker_gate = gate.clone();
    let blocker = controller.execute(
        async move {
            blocker_gate.cancelled().await;
            Ok(())
        },
        SubmitOptions::default(),
    );
    sleep(Duration::from_millis(20)).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (name, priority) in [("first-low", 0), ("high", 3), ("second-low", 0)] {
        let order = Arc::clone(&order);
        handles.push(controller.execute(
            async move {
                order.lock().unwrap().push(name);
                Ok(())
            },
            SubmitOptions {
                priority,
                kind: Some(name.to_string()),
                ..Default::default()
            },
        ));
    }

    gate.cancel();
    blocker.await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        order.lock().unwrap().as_slice(),
        &["high", "first-low", "second-low"]
    );
}

#[tokio::test]
async fn usage_and_profile_relations_fill_up() {
    let store: Arc<dyn ScalingStore> = Arc::new(InMemoryScalingStore::new(retention()));
    let controller = Controller::builder(ControllerConfig {
        monitoring_interval_ms: 50,
        ..ControllerConfig::default()
    })
    .source(FakeSource::new(40.0, 55.0))
    .store(Arc::clone(&store))
    .build();

    controller.initialize().await;
    controller
        .run(
            async {
                sleep(Duration::from_millis(10)).await;
                Ok(())
            },
            SubmitOptions {
                kind: Some("inference".to_string()),
                intensity: 0.6,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    controller.shutdown().await;

    assert!(!controller.usage_history().is_empty());
    let profiles = controller.operation_profiles();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].operation_type, "inference");
    assert_eq!(profiles[0].count, 1);
}
