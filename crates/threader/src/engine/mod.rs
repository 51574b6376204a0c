//! Scaling decision engine
//!
//! Produces the recommended concurrency limit each tick. Decision order:
//! hard emergency clamp, emergency adaptation, scale-up validation rollback,
//! demand-driven scaling, then a blend of trend, reward-search and PID
//! targets. Upward moves are gated by guardrails and tracked by a single
//! pending validation.

mod bayes;
mod guardrails;
mod predict;

pub use guardrails::{Guardrails, PendingValidation};
pub use predict::{predict_load_with_threads, LoadPrediction};

use crate::config::ControllerConfig;
use crate::history::HistoryStore;
use crate::models::{
    DemandPoint, OperationMix, PerfPoint, QueueSnapshot, ScalingDecision, ScalingRecord,
    TelemetrySample,
};
use crate::perf::ThreadPerf;
use crate::persist::ScalingStore;
use crate::pid::PidController;
use crate::reward::{RewardCalculator, RewardInputs};
use crate::trend::{self, TrendAction};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Telemetry window handed to the trend rules, in seconds.
const RECENT_WINDOW_SEC: u64 = 60;

/// Iteration budget for the reward search.
const BAYES_ITERATIONS: usize = 5;

/// Emergency-tick tolerance before the adaptive clamp fires.
const MAX_CONSECUTIVE_EMERGENCIES: u32 = 3;
const MAX_CONSECUTIVE_NEAR_EMERGENCIES: u32 = 10;

/// Contiguous stable time that resets the emergency counters.
const STABLE_RESET_MS: i64 = 30_000;

/// Demand points scanned for the recent-high-demand check.
const RECENT_DEMAND_POINTS: usize = 10;

/// Mix snapshots kept for drift nudges.
const MIX_SNAPSHOTS: usize = 5;

/// Introspection view of the engine.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub last_recommended: u32,
    pub optimal_threads: Option<u32>,
    pub validation_in_flight: bool,
    pub consecutive_emergencies: u32,
    pub consecutive_near_emergencies: u32,
}

/// Per-decision diagnostic values, persisted with the scaling record.
#[derive(Debug, Default, Clone, Copy)]
struct Diagnostics {
    pid_output: Option<f64>,
    bayes_output: Option<f64>,
    demand_score: Option<f64>,
}

enum DemandOutcome {
    Decide(u32, String, f64),
    None,
}

enum Hold {
    AwaitingValidation,
    HistoricalBlock,
    Cooldown,
}

impl Hold {
    fn reason(&self) -> &'static str {
        match self {
            Hold::AwaitingValidation | Hold::Cooldown => "awaiting_scale_up_validation_window",
            Hold::HistoricalBlock => "historical_block_scale_up",
        }
    }
}

/// The decision engine. Single-writer: only the supervisor drives it.
pub struct DecisionEngine {
    config: ControllerConfig,
    history: Arc<HistoryStore>,
    store: Arc<dyn ScalingStore>,
    pid: PidController,
    reward: RewardCalculator,
    perf: ThreadPerf,
    recent_mixes: VecDeque<OperationMix>,
    last_recommended: u32,
    last_scaling_decision_ms: Option<i64>,
    pending: Option<PendingValidation>,
    consecutive_emergencies: u32,
    consecutive_near_emergencies: u32,
    stable_since_ms: Option<i64>,
    diag: Diagnostics,
}

impl DecisionEngine {
    pub fn new(
        config: ControllerConfig,
        history: Arc<HistoryStore>,
        store: Arc<dyn ScalingStore>,
        initial_limit: u32,
    ) -> Self {
        let reward = RewardCalculator::new(config.high_thresholds, config.emergency_limits);
        let pid = PidController::new(config.pid);
        Self {
            config,
            history,
            store,
            pid,
            reward,
            perf: ThreadPerf::new(),
            recent_mixes: VecDeque::new(),
            last_recommended: initial_limit.max(1),
            last_scaling_decision_ms: None,
            pending: None,
            consecutive_emergencies: 0,
            consecutive_near_emergencies: 0,
            stable_since_ms: None,
            diag: Diagnostics::default(),
        }
    }

    /// Feed one tick's performance point into the per-level tracker.
    pub fn record(&mut self, point: &PerfPoint) {
        self.perf.record(
            point.thread_count,
            point.throughput,
            point.avg_latency_ms,
            Some(point.backlog as f64),
        );

        while self.recent_mixes.len() >= MIX_SNAPSHOTS {
            self.recent_mixes.pop_front();
        }
        self.recent_mixes.push_back(point.operation_mix.clone());

        let history_len = self.history.perf_points().len();
        self.perf.update_optimal(history_len);
    }

    /// Produce the recommendation for this tick.
    pub fn decide(&mut self, now_ms: i64, queue: &QueueSnapshot) -> ScalingDecision {
        self.diag = Diagnostics::default();

        let samples = self.history.recent(RECENT_WINDOW_SEC);
        let latest = samples.last().cloned();

        let limit = self.last_recommended.max(1);
        let utilization = queue.active_threads as f64 / limit as f64;
        let has_unmet_demand = queue.backlog >= limit as usize
            || (queue.queue_pressure > 0 && queue.active_threads >= limit);
        self.diag.demand_score = Some(utilization);
        self.history.append_demand(DemandPoint {
            ts: now_ms,
            queue_pressure: queue.queue_pressure,
            active_threads: queue.active_threads,
            utilization,
            has_unmet_demand,
            backlog: queue.backlog,
        });

        // 1. Hard emergency clamp.
        if latest.as_ref().is_some_and(|s| self.hard_emergency(s)) {
            return self.finalize(
                now_ms,
                queue,
                latest.as_ref(),
                1,
                "hard_emergency_clamp".to_string(),
                1.0,
            );
        }

        // 2. Emergency adaptation.
        let is_emergency = latest.as_ref().is_some_and(|s| self.is_emergency(s));
        let is_near = latest.as_ref().is_some_and(|s| self.is_near_emergency(s));
        self.track_emergencies(now_ms, is_emergency, is_near);
        if self.consecutive_emergencies > MAX_CONSECUTIVE_EMERGENCIES
            || self.consecutive_near_emergencies > MAX_CONSECUTIVE_NEAR_EMERGENCIES
        {
            return self.finalize(
                now_ms,
                queue,
                latest.as_ref(),
                1,
                "emergency_override".to_string(),
                0.9,
            );
        }

        // 3. Scale-up validation rollback.
        if let Some((threads, reason)) = self.resolve_validation(now_ms) {
            return self.finalize(now_ms, queue, latest.as_ref(), threads, reason, 0.85);
        }

        let intensity = queue.intensity.clamp(0.0, 1.0);
        let adjusted_max = self.adjusted_ceiling(intensity);

        // 4. Demand-driven decision.
        match self.demand_decision(now_ms, limit, utilization, has_unmet_demand, intensity, adjusted_max, queue)
        {
            DemandOutcome::Decide(threads, reason, confidence) => {
                return self.finalize(now_ms, queue, latest.as_ref(), threads, reason, confidence);
            }
            DemandOutcome::None => {}
        }

        // 5. Model blend.
        let (threads, reason, confidence) =
            self.model_blend(now_ms, queue, &samples, limit, adjusted_max);
        self.finalize(now_ms, queue, latest.as_ref(), threads, reason, confidence)
    }

    /// Engine introspection snapshot.
    pub fn state(&self) -> EngineState {
        EngineState {
            last_recommended: self.last_recommended,
            optimal_threads: self.perf.optimal(),
            validation_in_flight: self.pending.is_some(),
            consecutive_emergencies: self.consecutive_emergencies,
            consecutive_near_emergencies: self.consecutive_near_emergencies,
        }
    }

    pub fn last_recommended(&self) -> u32 {
        self.last_recommended
    }

    fn hard_emergency(&self, s: &TelemetrySample) -> bool {
        let e = &self.config.emergency_limits;
        s.cpu_temp.is_some_and(|v| v >= e.cpu_temp)
            || s.cpu_usage.is_some_and(|v| v >= e.cpu_usage)
            || s.gpu_usage.is_some_and(|v| v >= e.gpu_usage)
            || s.gpu_temp.is_some_and(|v| v >= e.gpu_temp)
    }

    fn is_emergency(&self, s: &TelemetrySample) -> bool {
        self.hard_emergency(s)
            || s.mem_usage
                .is_some_and(|v| v >= self.config.emergency_limits.memory_usage)
    }

    fn is_near_emergency(&self, s: &TelemetrySample) -> bool {
        let h = &self.config.high_thresholds;
        s.cpu_temp.is_some_and(|v| v > h.cpu_temp)
            || s.cpu_usage.is_some_and(|v| v > h.cpu_usage)
            || s.mem_usage.is_some_and(|v| v > h.memory_usage)
            || s.gpu_usage.is_some_and(|v| v > h.gpu_usage)
            || s.gpu_temp.is_some_and(|v| v > h.gpu_temp)
    }

    fn track_emergencies(&mut self, now_ms: i64, is_emergency: bool, is_near: bool) {
        if is_emergency {
            self.consecutive_emergencies += 1;
            self.stable_since_ms = None;
        } else if is_near {
            self.consecutive_near_emergencies += 1;
            self.stable_since_ms = None;
        } else {
            match self.stable_since_ms {
                None => self.stable_since_ms = Some(now_ms),
                Some(since) if now_ms - since >= STABLE_RESET_MS => {
                    if self.consecutive_emergencies > 0 || self.consecutive_near_emergencies > 0 {
                        debug!("Stable period elapsed, resetting emergency counters");
                    }
                    self.consecutive_emergencies = 0;
                    self.consecutive_near_emergencies = 0;
                }
                Some(_) => {}
            }
        }
    }

    /// Judge a matured pending validation; returns a rollback when the
    /// target level regressed past the guardrail tolerance.
    fn resolve_validation(&mut self, now_ms: i64) -> Option<(u32, String)> {
        let pending = self.pending.as_ref()?;
        if pending.expired(now_ms) {
            debug!(
                target_threads = pending.target_threads,
                "Scale-up validation expired without maturing"
            );
            self.pending = None;
            return None;
        }
        if !pending.matured(&self.perf) {
            return None;
        }

        let target = pending.target_threads;
        let baseline = pending.baseline_threads;
        let tolerance = pending.guardrails.degradation_tolerance;
        let baseline_cum = pending.baseline_cumulative_time;
        let target_cum = self.perf.averages(target).map(|a| a.cumulative_time);
        self.pending = None;

        if let (Some(base), Some(curr)) = (baseline_cum, target_cum) {
            if curr > base * (1.0 + tolerance) {
                info!(
                    target_threads = target,
                    baseline_threads = baseline,
                    base_cumulative = base,
                    current_cumulative = curr,
                    "Scale-up regressed, rolling back"
                );
                return Some((baseline, format!("validation_regression_target_{target}")));
            }
        }
        debug!(target_threads = target, "Scale-up validated");
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn demand_decision(
        &mut self,
        now_ms: i64,
        limit: u32,
        utilization: f64,
        has_unmet_demand: bool,
        intensity: f64,
        adjusted_max: u32,
        queue: &QueueSnapshot,
    ) -> DemandOutcome {
        if (has_unmet_demand || utilization > 0.8) && limit < adjusted_max {
            return match self.can_scale_up(now_ms, limit, limit + 1) {
                Ok(_) => DemandOutcome::Decide(limit + 1, "demand_scale_up".to_string(), 0.75),
                Err(hold) => DemandOutcome::Decide(limit, hold.reason().to_string(), 0.6),
            };
        }

        let idle_threshold = if intensity > 0.7 { 0.4 } else { 0.3 };
        if utilization < idle_threshold
            && queue.queue_pressure == 0
            && !self.recent_high_demand()
            && limit > 1
        {
            return DemandOutcome::Decide(
                limit - 1,
                "low_utilization_scale_down".to_string(),
                0.7,
            );
        }

        DemandOutcome::None
    }

    fn model_blend(
        &mut self,
        now_ms: i64,
        queue: &QueueSnapshot,
        samples: &[TelemetrySample],
        limit: u32,
        adjusted_max: u32,
    ) -> (u32, String, f64) {
        let Some(cpu) = samples.iter().rev().find_map(|s| s.cpu_usage) else {
            return (limit, "maintain_stable".to_string(), 0.5);
        };

        self.pid.set_output_bounds(1, adjusted_max.max(1) as i64);
        let pid_target = self.pid.update(cpu, now_ms).max(1) as u32;
        self.diag.pid_output = Some(pid_target as f64);

        let search_min = pid_target.saturating_sub(1).max(1);
        let search_max = pid_target.max(adjusted_max);

        let points = self.history.perf_points();
        let reward = self.reward;
        let thresholds = self.config.high_thresholds;
        let measured_throughput = queue.throughput;
        let latency_ms = queue.avg_latency_ms;
        let backlog = queue.backlog as f64;
        let outcome = bayes::maximize(search_min, search_max, BAYES_ITERATIONS, |t| {
            let pred = predict::predict_load_with_threads(&points, t, &thresholds);
            let ratio = t as f64 / limit.max(1) as f64;
            let projected = match (measured_throughput, latency_ms) {
                (Some(thr), _) if thr > 0.0 => thr * ratio,
                (_, Some(lat)) => t as f64 / (lat.max(1.0) / 1000.0),
                _ => 0.0,
            };
            reward.evaluate(&RewardInputs {
                throughput: projected,
                latency_ms: latency_ms.unwrap_or(1.0),
                backlog,
                predicted_cpu: pred.cpu,
                predicted_temp: pred.temp,
                predicted_gpu_usage: pred.gpu_usage,
                predicted_gpu_temp: pred.gpu_temp,
            })
        });
        let bayes_threads = outcome.threads.clamp(search_min, search_max);
        self.diag.bayes_output = Some(bayes_threads as f64);

        let rec = trend::recommendation(samples, &self.config.high_thresholds);
        let mut trend_threads = match rec.action {
            TrendAction::ScaleUp => limit + 1,
            TrendAction::ScaleDown => limit.saturating_sub(1).max(1),
            TrendAction::Maintain => limit,
        }
        .clamp(1, adjusted_max.max(1));

        // Rising mix intensity argues for caution, falling for headroom.
        let mixes: Vec<OperationMix> = self.recent_mixes.iter().cloned().collect();
        if let Some(delta) = trend::operation_mix_diff(&mixes).last() {
            if delta.intensity_change > f64::EPSILON {
                trend_threads = trend_threads.saturating_sub(1).max(1);
            } else if delta.intensity_change < -f64::EPSILON {
                trend_threads = (trend_threads + 1).min(adjusted_max.max(1));
            }
        }

        let blended = 0.2 * trend_threads as f64
            + 0.5 * bayes_threads as f64
            + 0.3 * pid_target as f64;
        if !blended.is_finite() {
            return (limit, "maintain_stable".to_string(), 0.5);
        }

        let mut proposed = (blended.round() as i64).clamp(1, adjusted_max.max(1) as i64) as u32;
        if proposed > limit {
            // Conservative stepping: one level per decision.
            proposed = proposed.min(limit + 1);
            return match self.can_scale_up(now_ms, limit, proposed) {
                Ok(_) => (proposed, "model_blend".to_string(), 0.6),
                Err(hold) => (limit, hold.reason().to_string(), 0.6),
            };
        }
        (proposed, "model_blend".to_string(), 0.6)
    }

    /// Gate for any upward step.
    fn can_scale_up(&self, now_ms: i64, prev: u32, next: u32) -> Result<Guardrails, Hold> {
        if self.pending.is_some() {
            return Err(Hold::AwaitingValidation);
        }

        let points = self.history.perf_points();
        let cooldown = self.cooldown_ms(&points);
        let g = guardrails::derive(
            prev,
            next,
            &self.perf,
            &points,
            cooldown,
            self.config.min_data_window_ms,
        );

        if let (Some(prev_avg), Some(next_avg)) =
            (self.perf.averages(prev), self.perf.averages(next))
        {
            if next_avg.cumulative_time
                > prev_avg.cumulative_time * (1.0 + g.degradation_tolerance)
            {
                return Err(Hold::HistoricalBlock);
            }
        }

        let min_gap = g.validation_window_ms.max(cooldown as f64);
        if let Some(last) = self.last_scaling_decision_ms {
            if ((now_ms - last) as f64) < min_gap {
                return Err(Hold::Cooldown);
            }
        }
        Ok(g)
    }

    /// Effective cooldown: configured, or derived from the thermal constant.
    fn cooldown_ms(&self, points: &[PerfPoint]) -> u64 {
        match self.config.scale_cooldown_ms {
            Some(v) => v,
            None => {
                let thermal = guardrails::thermal_constant_ms(points);
                ((2.0 * thermal) as u64).min(10_000)
            }
        }
    }

    /// Exploration ceiling after intensity adjustment.
    fn adjusted_ceiling(&self, intensity: f64) -> u32 {
        let ceiling = match self.config.max_threads {
            Some(m) => m.max(1),
            None => {
                let points = self.history.perf_points();
                let history_max = points
                    .iter()
                    .map(|p| p.thread_count)
                    .max()
                    .unwrap_or(0)
                    .max(self.last_recommended);
                let optimal_bias = self.perf.optimal().map_or(0, |o| o + 4);
                let demand_push = self
                    .history
                    .demand_points()
                    .iter()
                    .map(|d| d.queue_pressure + d.active_threads as usize)
                    .max()
                    .unwrap_or(0) as u32;
                4u32.max(history_max.saturating_mul(2))
                    .max(optimal_bias)
                    .max(demand_push.saturating_add(history_max).saturating_add(1))
            }
        };

        let factor = (1.0 - 0.3 * intensity).clamp(0.5, 1.5);
        ((ceiling as f64 * factor).floor() as u32).max(1)
    }

    fn recent_high_demand(&self) -> bool {
        let points = self.history.demand_points();
        points
            .iter()
            .rev()
            // skip this tick's own point
            .skip(1)
            .take(RECENT_DEMAND_POINTS)
            .any(|d| d.has_unmet_demand)
    }

    fn finalize(
        &mut self,
        now_ms: i64,
        queue: &QueueSnapshot,
        latest: Option<&TelemetrySample>,
        threads: u32,
        reason: String,
        confidence: f64,
    ) -> ScalingDecision {
        let mut recommended = threads.max(1);
        if let Some(m) = self.config.max_threads {
            recommended = recommended.min(m.max(1));
        }
        // Demand cap: never provision past the work actually in flight.
        recommended = recommended.min(queue.backlog.max(1) as u32);

        let previous = self.last_recommended;
        if recommended != previous {
            self.last_scaling_decision_ms = Some(now_ms);
            if recommended > previous {
                let points = self.history.perf_points();
                let cooldown = self.cooldown_ms(&points);
                let g = guardrails::derive(
                    previous,
                    recommended,
                    &self.perf,
                    &points,
                    cooldown,
                    self.config.min_data_window_ms,
                );
                self.pending = Some(PendingValidation {
                    target_threads: recommended,
                    baseline_threads: previous,
                    started_at_ms: now_ms,
                    guardrails: g,
                    baseline_cumulative_time: self
                        .perf
                        .averages(previous)
                        .map(|a| a.cumulative_time),
                    initial_target_samples: self.perf.samples_at(recommended),
                });
            }

            info!(
                from = previous,
                to = recommended,
                reason = %reason,
                confidence,
                "Scaling recommendation changed"
            );
            self.store.record_scaling(&ScalingRecord {
                ts: now_ms,
                thread_count: recommended,
                cpu_usage: latest.and_then(|s| s.cpu_usage),
                gpu_usage: latest.and_then(|s| s.gpu_usage),
                memory_usage: latest.and_then(|s| s.mem_usage),
                temperature: latest.and_then(|s| s.cpu_temp),
                active_operations: queue.active_threads,
                queue_length: queue.queue_pressure,
                scaling_decision: reason.clone(),
                pid_output: self.diag.pid_output,
                bayes_optimization: self.diag.bayes_output,
                demand_score: self.diag.demand_score,
            });
            self.last_recommended = recommended;
        }

        ScalingDecision {
            ts: now_ms,
            recommended_threads: recommended,
            previous_threads: previous,
            reason,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{InMemoryScalingStore, Retention};

    fn sample(ts: i64, cpu: f64, temp: f64) -> TelemetrySample {
        TelemetrySample {
            ts,
            cpu_usage: Some(cpu),
            cpu_temp: Some(temp),
            mem_usage: Some(40.0),
            gpu_usage: None,
            gpu_temp: None,
        }
    }

    fn queue(limit: u32, active: u32, queued: usize) -> QueueSnapshot {
        QueueSnapshot {
            limit,
            active_threads: active,
            queue_pressure: queued,
            backlog: queued + active as usize,
            throughput: Some(10.0),
            avg_latency_ms: Some(100.0),
            p95_latency_ms: None,
            operation_mix: OperationMix::default(),
            intensity: 0.0,
            total_operations: 0,
        }
    }

    fn engine(initial: u32) -> (DecisionEngine, Arc<HistoryStore>) {
        let history = Arc::new(HistoryStore::new(5, 300, 200));
        let store = Arc::new(InMemoryScalingStore::new(Retention {
            usage_max_age_ms: 300_000,
            scaling_max_age_ms: 1_200_000,
        }));
        let engine = DecisionEngine::new(ControllerConfig::default(), history.clone(), store, initial);
        (engine, history)
    }

    fn perf_point(ts: i64, threads: u32, throughput: f64, latency_ms: f64) -> PerfPoint {
        PerfPoint {
            sample: sample(ts, 50.0, 60.0),
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
        }
    }

    #[test]
    fn hard_emergency_clamps_to_one() {
        let (mut engine, history) = engine(4);
        history.append_sample(TelemetrySample {
            cpu_temp: Some(96.0),
            ..sample(1_000, 50.0, 96.0)
        });

        let d = engine.decide(1_000, &queue(4, 4, 4));
        assert_eq!(d.recommended_threads, 1);
        assert_eq!(d.reason, "hard_emergency_clamp");
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn unmet_demand_scales_up_one_step() {
        let (mut engine, history) = engine(2);
        history.append_sample(sample(1_000, 50.0, 60.0));

        let d = engine.decide(1_000, &queue(2, 2, 3));
        assert_eq!(d.recommended_threads, 3);
        assert_eq!(d.reason, "demand_scale_up");
        assert!(engine.state().validation_in_flight);
    }

    #[test]
    fn second_step_blocked_by_pending_validation() {
        let (mut engine, history) = engine(2);
        history.append_sample(sample(1_000, 50.0, 60.0));
        engine.decide(1_000, &queue(2, 2, 3));

        history.append_sample(sample(2_000, 55.0, 62.0));
        let d = engine.decide(2_000, &queue(3, 3, 4));
        assert_eq!(d.recommended_threads, 3);
        assert_eq!(d.reason, "awaiting_scale_up_validation_window");
    }

    #[test]
    fn low_utilization_scales_down() {
        let (mut engine, history) = engine(2);
        history.append_sample(sample(1_000, 30.0, 50.0));

        let d = engine.decide(1_000, &queue(2, 0, 0));
        assert_eq!(d.recommended_threads, 1);
        assert_eq!(d.reason, "low_utilization_scale_down");
    }

    #[test]
    fn recommendation_never_exceeds_backlog() {
        let (mut engine, history) = engine(4);
        history.append_sample(sample(1_000, 60.0, 70.0));

        // moderate utilization, tiny backlog: blend path, capped at backlog
        let d = engine.decide(1_000, &queue(4, 2, 0));
        assert!(d.recommended_threads <= 2);
    }

    #[test]
    fn max_threads_caps_every_recommendation() {
        let config = ControllerConfig {
            max_threads: Some(3),
            ..ControllerConfig::default()
        };
        let history = Arc::new(HistoryStore::new(5, 300, 200));
        let store = Arc::new(InMemoryScalingStore::new(Retention {
            usage_max_age_ms: 300_000,
            scaling_max_age_ms: 1_200_000,
        }));
        let mut engine = DecisionEngine::new(config, history.clone(), store, 3);
        history.append_sample(sample(1_000, 50.0, 60.0));

        let d = engine.decide(1_000, &queue(3, 3, 10));
        assert!(d.recommended_threads <= 3);
    }

    #[test]
    fn validation_regression_rolls_back() {
        let (mut engine, history) = engine(2);

        // good history at level 2
        for i in 0..10 {
            let p = perf_point(i * 1000, 2, 20.0, 50.0);
            history.append_perf(p.clone());
            engine.record(&p);
        }
        history.append_sample(sample(10_000, 50.0, 60.0));
        let d = engine.decide(10_000, &queue(2, 2, 4));
        assert_eq!(d.recommended_threads, 3);

        // the new level performs much worse
        for i in 0..25 {
            let p = perf_point(11_000 + i * 1000, 3, 2.0, 400.0);
            history.append_perf(p.clone());
            engine.record(&p);
        }
        history.append_sample(sample(40_000, 55.0, 62.0));
        let d = engine.decide(40_000, &queue(3, 3, 4));
        assert_eq!(d.recommended_threads, 2);
        assert!(d.reason.starts_with("validation_regression_target_3"));
        assert!(!engine.state().validation_in_flight);
    }

    #[test]
    fn emergency_override_after_repeated_near_emergencies() {
        let (mut engine, history) = engine(4);
        let mut last = ScalingDecision {
            ts: 0,
            recommended_threads: 4,
            previous_threads: 4,
            reason: String::new(),
            confidence: 0.0,
        };
        for i in 0..12 {
            let ts = (i + 1) * 1000;
            history.append_sample(sample(ts, 90.0, 80.0)); // cpu above high threshold
            last = engine.decide(ts, &queue(4, 4, 4));
        }
        assert_eq!(last.reason, "emergency_override");
        assert_eq!(last.recommended_threads, 1);
    }

    #[test]
    fn stable_period_resets_emergency_counters() {
        let (mut engine, history) = engine(4);
        for i in 0..5 {
            let ts = (i + 1) * 1000;
            history.append_sample(sample(ts, 90.0, 80.0));
            engine.decide(ts, &queue(4, 4, 4));
        }
        assert!(engine.state().consecutive_near_emergencies > 0);

        // 40s of calm ticks
        for i in 0..41 {
            let ts = 10_000 + i * 1000;
            history.append_sample(sample(ts, 40.0, 55.0));
            engine.decide(ts, &queue(4, 4, 4));
        }
        assert_eq!(engine.state().consecutive_near_emergencies, 0);
    }

    #[test]
    fn decisions_are_persisted() {
        let history = Arc::new(HistoryStore::new(5, 300, 200));
        let store = Arc::new(InMemoryScalingStore::new(Retention {
            usage_max_age_ms: 300_000,
            scaling_max_age_ms: 1_200_000,
        }));
        let mut engine =
            DecisionEngine::new(ControllerConfig::default(), history.clone(), store.clone(), 2);
        history.append_sample(sample(1_000, 50.0, 60.0));
        engine.decide(1_000, &queue(2, 2, 3));

        let log = store.scaling_history();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].thread_count, 3);
        assert_eq!(log[0].scaling_decision, "demand_scale_up");
    }
}
