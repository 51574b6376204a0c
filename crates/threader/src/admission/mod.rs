//! Admission manager
//!
//! Owns the request queue and enforces the concurrency limit. Queue order is
//! emergency-first, then priority, then submission order. Limit reductions
//! below the active count are deferred until completions drain the work;
//! a queued emergency request may exceed the limit by one, capped at two.

use crate::error::TaskError;
use crate::models::{OperationMix, QueueSnapshot};
use crate::observability::ControllerMetrics;
use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Completion window used for throughput and latency measurement.
const MEASUREMENT_WINDOW_MS: i64 = 10_000;

/// The emergency bypass never raises the effective limit past this.
const BYPASS_CEILING: u32 = 2;

/// Mix bucket for submissions without a kind label.
const DEFAULT_KIND: &str = "default";

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Options accepted by `submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: i32,
    pub emergency: bool,
    pub timeout_ms: Option<u64>,
    pub cancel_token: Option<CancellationToken>,
    /// Operation kind label for the mix and profile relations.
    pub kind: Option<String>,
    /// Relative per-operation resource weight in `[0, 1]`.
    pub intensity: f64,
}

/// Awaitable handle to a submitted operation's terminal state.
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// First terminal result wins; later attempts are no-ops.
struct CompletionSlot<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, TaskError>>>>,
    failed: std::sync::atomic::AtomicBool,
}

impl<T: Send> CompletionSlot<T> {
    fn complete(&self, result: Result<T, TaskError>) -> bool {
        let Some(tx) = self.tx.lock().expect("slot mutex poisoned").take() else {
            return false;
        };
        if result.is_err() {
            self.failed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        let _ = tx.send(result);
        true
    }
}

/// Type-erased failure side of a completion slot.
trait FailSlot: Send + Sync {
    /// Returns false if the request already reached a terminal state.
    fn fail(&self, err: TaskError) -> bool;
    /// Whether the terminal state was a failure.
    fn was_failed(&self) -> bool;
}

impl<T: Send> FailSlot for CompletionSlot<T> {
    fn fail(&self, err: TaskError) -> bool {
        self.complete(Err(err))
    }

    fn was_failed(&self) -> bool {
        self.failed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

struct QueuedRequest {
    id: u64,
    seq: u64,
    priority: i32,
    emergency: bool,
    kind: String,
    intensity: f64,
    job: Job,
    slot: Arc<dyn FailSlot>,
    done: CancellationToken,
}

struct ActiveMeta {
    emergency: bool,
    kind: String,
    intensity: f64,
    started_at_ms: i64,
    slot: Arc<dyn FailSlot>,
    done: CancellationToken,
}

/// One completed (or failed) operation, for measurement and profiles.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub kind: String,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
    pub duration_ms: f64,
    pub failed: bool,
}

/// Introspection view of the admission manager.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    pub limit: u32,
    pub desired_limit: Option<u32>,
    pub active: u32,
    pub queued: usize,
    pub emergency_bypass_active: bool,
    pub total_operations: u64,
}

struct State {
    queue: Vec<QueuedRequest>,
    limit: u32,
    desired_limit: Option<u32>,
    active: u32,
    active_meta: HashMap<u64, ActiveMeta>,
    emergency_bypass_active: bool,
    is_dispatching: bool,
    next_seq: u64,
    next_id: u64,
    total_operations: u64,
    completions: VecDeque<CompletionRecord>,
    profile_backlog: Vec<CompletionRecord>,
}

type ScalingCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// The admission manager. Shared as `Arc`; all mutation happens under one
/// mutex and the dispatch loop never suspends while holding it.
pub struct AdmissionManager {
    state: Mutex<State>,
    max_history_size: usize,
    on_scaling_update: Option<ScalingCallback>,
    metrics: ControllerMetrics,
}

impl AdmissionManager {
    pub fn new(
        initial_limit: u32,
        max_history_size: usize,
        on_scaling_update: Option<ScalingCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: Vec::new(),
                limit: initial_limit.max(1),
                desired_limit: None,
                active: 0,
                active_meta: HashMap::new(),
                emergency_bypass_active: false,
                is_dispatching: false,
                next_seq: 0,
                next_id: 0,
                total_operations: 0,
                completions: VecDeque::new(),
                profile_backlog: Vec::new(),
            }),
            max_history_size: max_history_size.max(1),
            on_scaling_update,
            metrics: ControllerMetrics::new(),
        })
    }

    /// Submit an operation for admission. The handle resolves with the
    /// operation's result, or with the timeout/cancel failure that ended it.
    pub fn submit<F, T>(self: &Arc<Self>, op: F, opts: SubmitOptions) -> CompletionHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(CompletionSlot {
            tx: Mutex::new(Some(tx)),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::pin(async move {
            match op.await {
                Ok(value) => {
                    job_slot.complete(Ok(value));
                }
                Err(err) => {
                    job_slot.complete(Err(TaskError::Operation(err)));
                }
            }
        });

        let done = CancellationToken::new();
        let id = {
            let mut s = self.lock();
            let id = s.next_id;
            s.next_id += 1;
            let seq = s.next_seq;
            s.next_seq += 1;
            s.total_operations += 1;
            s.queue.push(QueuedRequest {
                id,
                seq,
                priority: opts.priority,
                emergency: opts.emergency,
                kind: opts.kind.clone().unwrap_or_else(|| DEFAULT_KIND.to_string()),
                intensity: opts.intensity.clamp(0.0, 1.0),
                job,
                slot: slot.clone(),
                done: done.clone(),
            });
            id
        };

        self.spawn_watcher(id, opts.timeout_ms.filter(|ms| *ms > 0), opts.cancel_token, done);
        self.dispatch();
        CompletionHandle { rx }
    }

    /// Apply a new concurrency limit. A reduction below the active count is
    /// remembered and applied once completions drain the active work.
    pub fn update_limit(self: &Arc<Self>, requested: u32) {
        let mut emit = None;
        let mut kick = false;
        {
            let mut s = self.lock();
            let mut n = requested;
            if n < 1 {
                warn!(requested, "Invalid concurrency limit, coercing to 1");
                n = 1;
            }

            if s.emergency_bypass_active {
                let emergencies = s.queue.iter().filter(|r| r.emergency).count()
                    + s.active_meta.values().filter(|m| m.emergency).count();
                let floor = (emergencies as u32).min(BYPASS_CEILING).max(1);
                n = n.max(floor);
            }

            let effective = if n < s.active {
                debug!(
                    requested = n,
                    active = s.active,
                    "Deferring scale-down below active work"
                );
                s.desired_limit = Some(n);
                s.active
            } else {
                s.desired_limit = None;
                n
            };

            if effective != s.limit {
                let old = s.limit;
                s.limit = effective;
                emit = Some((effective, old));
                kick = effective > old;
            }
        }

        if let Some((new_limit, old_limit)) = emit {
            self.emit_scaling(new_limit, old_limit);
        }
        if kick {
            self.dispatch();
        }
    }

    /// Current effective limit.
    pub fn limit(&self) -> u32 {
        self.lock().limit
    }

    /// Introspection snapshot.
    pub fn state(&self) -> AdmissionState {
        let s = self.lock();
        AdmissionState {
            limit: s.limit,
            desired_limit: s.desired_limit,
            active: s.active,
            queued: s.queue.len(),
            emergency_bypass_active: s.emergency_bypass_active,
            total_operations: s.total_operations,
        }
    }

    /// Queue snapshot with derived throughput and latency measurements.
    pub fn queue_stats(&self) -> QueueSnapshot {
        let s = self.lock();
        let now = Utc::now().timestamp_millis();

        let recent: Vec<&CompletionRecord> = s
            .completions
            .iter()
            .filter(|c| now - c.completed_at_ms <= MEASUREMENT_WINDOW_MS)
            .collect();
        let throughput = if recent.is_empty() {
            None
        } else {
            Some(recent.len() as f64 / (MEASUREMENT_WINDOW_MS as f64 / 1000.0))
        };
        let avg_latency_ms = if recent.is_empty() {
            None
        } else {
            Some(recent.iter().map(|c| c.duration_ms).sum::<f64>() / recent.len() as f64)
        };
        let p95_latency_ms = percentile_ms(&recent, 95.0);

        let mut mix = BTreeMap::new();
        let mut intensity_sum = 0.0;
        let mut population = 0usize;
        for (kind, intensity) in s
            .queue
            .iter()
            .map(|r| (&r.kind, r.intensity))
            .chain(s.active_meta.values().map(|m| (&m.kind, m.intensity)))
        {
            *mix.entry(kind.clone()).or_insert(0.0) += intensity;
            intensity_sum += intensity;
            population += 1;
        }
        let intensity = if population == 0 {
            0.0
        } else {
            intensity_sum / population as f64
        };

        QueueSnapshot {
            limit: s.limit,
            active_threads: s.active,
            queue_pressure: s.queue.len(),
            backlog: s.queue.len() + s.active as usize,
            throughput,
            avg_latency_ms,
            p95_latency_ms,
            operation_mix: OperationMix(mix),
            intensity,
            total_operations: s.total_operations,
        }
    }

    /// Drain completion records destined for the operation profiles.
    pub fn take_profile_backlog(&self) -> Vec<CompletionRecord> {
        std::mem::take(&mut self.lock().profile_backlog)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("admission mutex poisoned")
    }

    /// Start as many queued requests as the limit (and the emergency bypass)
    /// allows. Re-entrancy is guarded so nested calls fall through.
    fn dispatch(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut s = self.lock();
            if s.is_dispatching {
                return;
            }
            s.is_dispatching = true;

            loop {
                let candidate = if s.active < s.limit {
                    best_index(&s.queue, false)
                } else {
                    // Emergency bypass: one extra slot, never past the ceiling.
                    let bypass_limit = (s.limit + 1).min(BYPASS_CEILING);
                    if s.active < bypass_limit {
                        best_index(&s.queue, true)
                    } else {
                        None
                    }
                };
                let Some(idx) = candidate else { break };

                let req = s.queue.swap_remove(idx);
                let via_bypass = s.active >= s.limit;
                if via_bypass {
                    s.emergency_bypass_active = true;
                }
                s.active += 1;
                let started_at_ms = Utc::now().timestamp_millis();
                s.active_meta.insert(
                    req.id,
                    ActiveMeta {
                        emergency: req.emergency,
                        kind: req.kind.clone(),
                        intensity: req.intensity,
                        started_at_ms,
                        slot: req.slot.clone(),
                        done: req.done.clone(),
                    },
                );
                to_start.push(req);
            }

            s.is_dispatching = false;
            self.metrics
                .set_queue_gauges(s.limit as i64, s.active as i64, s.queue.len() as i64);
        }

        for req in to_start {
            self.run(req);
        }
    }

    /// Run one admitted request to its terminal state.
    fn run(self: &Arc<Self>, req: QueuedRequest) {
        let manager = Arc::clone(self);
        let done = req.done;
        let mut job = req.job;
        let id = req.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut job => {}
                _ = done.cancelled() => {}
            }
            done.cancel();
            manager.on_terminal(id);
        });
    }

    /// Watch for the request's timeout or cancellation in either phase.
    fn spawn_watcher(
        self: &Arc<Self>,
        id: u64,
        timeout_ms: Option<u64>,
        cancel_token: Option<CancellationToken>,
        done: CancellationToken,
    ) {
        if timeout_ms.is_none() && cancel_token.is_none() {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let timeout_fut = async {
                match timeout_ms {
                    Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    None => std::future::pending().await,
                }
            };
            let cancel_fut = async {
                match cancel_token {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = done.cancelled() => {}
                _ = timeout_fut => {
                    manager.fail_request(id, TaskError::Timeout {
                        timeout_ms: timeout_ms.unwrap_or(0),
                    });
                }
                _ = cancel_fut => {
                    manager.fail_request(id, TaskError::Canceled);
                }
            }
        });
    }

    /// Fail a request wherever it currently lives. Queued requests are
    /// removed without ever starting; active requests stop being awaited.
    fn fail_request(self: &Arc<Self>, id: u64, err: TaskError) {
        let mut queued_terminal = None;
        let mut active_handles = None;
        {
            let mut s = self.lock();
            if let Some(pos) = s.queue.iter().position(|r| r.id == id) {
                let req = s.queue.swap_remove(pos);
                queued_terminal = Some((req.slot.clone(), req.done.clone(), req.kind.clone()));
            } else if let Some(meta) = s.active_meta.get(&id) {
                active_handles = Some((meta.slot.clone(), meta.done.clone()));
            }
        }

        if let Some((slot, done, kind)) = queued_terminal {
            debug!(id, kind = %kind, "Request failed while queued");
            slot.fail(err);
            done.cancel();
            return;
        }

        if let Some((slot, done)) = active_handles {
            if slot.fail(err) {
                debug!(id, "Request failed while active");
            }
            done.cancel();
        }
        // Already terminal: nothing to do.
    }

    /// Bookkeeping when an active request reaches a terminal state.
    fn on_terminal(self: &Arc<Self>, id: u64) {
        let mut emit = None;
        {
            let mut s = self.lock();
            let Some(meta) = s.active_meta.remove(&id) else {
                return;
            };
            s.active = s.active.saturating_sub(1);

            let now = Utc::now().timestamp_millis();
            let record = CompletionRecord {
                kind: meta.kind,
                started_at_ms: meta.started_at_ms,
                completed_at_ms: now,
                duration_ms: (now - meta.started_at_ms).max(0) as f64,
                failed: meta.slot.was_failed(),
            };
            while s.completions.len() >= self.max_history_size {
                s.completions.pop_front();
            }
            s.completions.push_back(record.clone());
            s.profile_backlog.push(record.clone());
            self.metrics
                .observe_completion(record.duration_ms / 1000.0, !record.failed);

            if meta.emergency && !s.active_meta.values().any(|m| m.emergency) {
                s.emergency_bypass_active = false;
            }

            if let Some(desired) = s.desired_limit {
                if s.active <= desired {
                    s.desired_limit = None;
                    let old = s.limit;
                    s.limit = desired.max(1);
                    if s.limit != old {
                        emit = Some((s.limit, old));
                    }
                }
            }
        }

        if let Some((new_limit, old_limit)) = emit {
            self.emit_scaling(new_limit, old_limit);
        }
        self.dispatch();
    }

    fn emit_scaling(&self, new_limit: u32, old_limit: u32) {
        debug!(from = old_limit, to = new_limit, "Concurrency limit changed");
        self.metrics.inc_scaling_decision();
        if new_limit == 1 && old_limit > 1 {
            self.metrics.inc_emergency_clamp();
        }
        if let Some(callback) = &self.on_scaling_update {
            callback(new_limit, old_limit);
        }
    }
}

/// Index of the best dispatch candidate: emergency first, then priority,
/// then submission order. `emergency_only` restricts to bypass candidates.
fn best_index(queue: &[QueuedRequest], emergency_only: bool) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, r)| !emergency_only || r.emergency)
        .max_by_key(|(_, r)| (r.emergency, r.priority, std::cmp::Reverse(r.seq)))
        .map(|(idx, _)| idx)
}

fn percentile_ms(records: &[&CompletionRecord], p: f64) -> Option<f64> {
    if records.is_empty() {
        return None;
    }
    let mut durations: Vec<f64> = records.iter().map(|c| c.duration_ms).collect();
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((p / 100.0) * (durations.len() - 1) as f64).round() as usize;
    Some(durations[idx.min(durations.len() - 1)])
}
