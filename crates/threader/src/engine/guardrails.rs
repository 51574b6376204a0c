//! Scale-up guardrails
//!
//! Derives how much evidence a proposed scale-up must gather before another
//! step is allowed: a thermal time constant estimated from history, a sample
//! quorum, a degradation tolerance, and the validation window combining them.

use crate::models::PerfPoint;
use crate::perf::ThreadPerf;

/// Thermal-constant clamp bounds and default, in milliseconds.
const THERMAL_MIN_MS: f64 = 2_000.0;
const THERMAL_MAX_MS: f64 = 20_000.0;
const THERMAL_DEFAULT_MS: f64 = 5_000.0;

/// Temperature rise that marks a tick pair as thermally coupled.
const TEMP_RISE_C: f64 = 2.0;

/// Guardrails for one proposed scale-up step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guardrails {
    pub thermal_constant_ms: f64,
    pub samples_required: usize,
    pub degradation_tolerance: f64,
    pub validation_window_ms: f64,
}

/// A live scale-up under validation. At most one exists at a time.
#[derive(Debug, Clone)]
pub struct PendingValidation {
    pub target_threads: u32,
    pub baseline_threads: u32,
    pub started_at_ms: i64,
    pub guardrails: Guardrails,
    /// Cumulative-time average at the baseline level when the step was taken.
    pub baseline_cumulative_time: Option<f64>,
    /// Samples the target level had when the step was taken.
    pub initial_target_samples: usize,
}

impl PendingValidation {
    /// Enough new samples have accumulated at the target level to judge it.
    pub fn matured(&self, perf: &ThreadPerf) -> bool {
        perf.samples_at(self.target_threads)
            .saturating_sub(self.initial_target_samples)
            >= self.guardrails.samples_required
    }

    /// The validation never matured within a generous multiple of its window.
    pub fn expired(&self, now_ms: i64) -> bool {
        (now_ms - self.started_at_ms) as f64 > self.guardrails.validation_window_ms * 4.0
    }
}

/// Mean milliseconds between ticks where the thread count rose and the CPU
/// temperature followed it up by more than `TEMP_RISE_C`.
pub fn thermal_constant_ms(points: &[PerfPoint]) -> f64 {
    let deltas: Vec<f64> = points
        .windows(2)
        .filter_map(|pair| {
            let (a, b) = (&pair[0], &pair[1]);
            let (Some(ta), Some(tb)) = (a.sample.cpu_temp, b.sample.cpu_temp) else {
                return None;
            };
            if b.thread_count > a.thread_count && tb - ta > TEMP_RISE_C {
                Some((b.sample.ts - a.sample.ts).max(0) as f64)
            } else {
                None
            }
        })
        .collect();

    if deltas.is_empty() {
        return THERMAL_DEFAULT_MS;
    }
    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    mean.clamp(THERMAL_MIN_MS, THERMAL_MAX_MS)
}

/// Derive guardrails for a `prev → next` scale-up.
#[allow(clippy::too_many_arguments)]
pub fn derive(
    prev: u32,
    next: u32,
    perf: &ThreadPerf,
    points: &[PerfPoint],
    scale_cooldown_ms: u64,
    min_data_window_ms: u64,
) -> Guardrails {
    let thermal = thermal_constant_ms(points);

    let history_quorum = (points.len() as f64 * 0.1).ceil() as usize;
    let sample_density = perf
        .samples_at(prev)
        .max(perf.samples_at(next))
        .max(history_quorum);
    let samples_required =
        (((sample_density + next as usize) as f64).sqrt().ceil() as usize).clamp(2, 25);

    let cov = perf
        .cumulative_time_cov(prev)
        .or_else(|| perf.cumulative_time_cov(next))
        .unwrap_or(0.0);
    let avg_utilization = if points.is_empty() {
        0.0
    } else {
        points.iter().map(|p| p.utilization).sum::<f64>() / points.len() as f64
    };
    let degradation_tolerance = (1.0 / (prev + next).max(1) as f64)
        .max(cov + avg_utilization / next.max(1) as f64);

    let avg_latency_ms = perf
        .averages(next)
        .or_else(|| perf.averages(prev))
        .map(|a| a.latency_ms)
        .unwrap_or(0.0);

    let cooldown = scale_cooldown_ms as f64;
    let floor = (avg_latency_ms * samples_required as f64)
        .max(cooldown * 0.5)
        .max(thermal * 0.75)
        .max(1_000.0);
    let ceiling = (min_data_window_ms as f64 * 0.5).max(5_000.0);
    let validation_window_ms = floor.min(ceiling).max(1_000.0).max(cooldown);

    Guardrails {
        thermal_constant_ms: thermal,
        samples_required,
        degradation_tolerance,
        validation_window_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationMix, TelemetrySample};

    fn point(ts: i64, threads: u32, temp: f64, utilization: f64) -> PerfPoint {
        PerfPoint {
            sample: TelemetrySample {
                ts,
                cpu_usage: Some(50.0),
                cpu_temp: Some(temp),
                mem_usage: Some(40.0),
                gpu_usage: None,
                gpu_temp: None,
            },
            thread_count: threads,
            active_threads: threads,
            queue_pressure: 0,
            backlog: threads as usize,
            utilization,
            throughput: Some(10.0),
            avg_latency_ms: Some(100.0),
            p95_latency_ms: None,
            operation_mix: OperationMix::default(),
            intensity: 0.0,
        }
    }

    #[test]
    fn thermal_constant_defaults_without_coupled_ticks() {
        let points = vec![point(0, 2, 60.0, 0.5), point(1_000, 2, 60.0, 0.5)];
        assert_eq!(thermal_constant_ms(&points), THERMAL_DEFAULT_MS);
    }

    #[test]
    fn thermal_constant_averages_coupled_ticks() {
        let points = vec![
            point(0, 2, 60.0, 0.5),
            point(4_000, 3, 64.0, 0.5), // +4°C on a scale-up, 4s gap
            point(8_000, 3, 64.0, 0.5),
            point(14_000, 4, 68.0, 0.5), // +4°C on a scale-up, 6s gap
        ];
        assert!((thermal_constant_ms(&points) - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn thermal_constant_is_clamped() {
        let points = vec![point(0, 2, 60.0, 0.5), point(60_000, 3, 65.0, 0.5)];
        assert_eq!(thermal_constant_ms(&points), THERMAL_MAX_MS);
    }

    #[test]
    fn samples_required_within_bounds() {
        let perf = ThreadPerf::new();
        let g = derive(2, 3, &perf, &[], 10_000, 10_000);
        assert!((2..=25).contains(&g.samples_required));
    }

    #[test]
    fn validation_window_at_least_cooldown() {
        let perf = ThreadPerf::new();
        let g = derive(2, 3, &perf, &[], 10_000, 10_000);
        assert!(g.validation_window_ms >= 10_000.0);
    }

    #[test]
    fn degradation_tolerance_has_floor() {
        let perf = ThreadPerf::new();
        let g = derive(2, 3, &perf, &[], 10_000, 10_000);
        assert!(g.degradation_tolerance >= 1.0 / 5.0);
    }

    #[test]
    fn pending_validation_matures_on_new_samples() {
        let mut perf = ThreadPerf::new();
        let pending = PendingValidation {
            target_threads: 3,
            baseline_threads: 2,
            started_at_ms: 0,
            guardrails: Guardrails {
                thermal_constant_ms: 5_000.0,
                samples_required: 3,
                degradation_tolerance: 0.2,
                validation_window_ms: 10_000.0,
            },
            baseline_cumulative_time: Some(0.1),
            initial_target_samples: 0,
        };
        assert!(!pending.matured(&perf));
        for _ in 0..3 {
            perf.record(3, Some(10.0), Some(100.0), None);
        }
        assert!(pending.matured(&perf));
    }

    #[test]
    fn pending_validation_expires() {
        let pending = PendingValidation {
            target_threads: 3,
            baseline_threads: 2,
            started_at_ms: 0,
            guardrails: Guardrails {
                thermal_constant_ms: 5_000.0,
                samples_required: 3,
                degradation_tolerance: 0.2,
                validation_window_ms: 10_000.0,
            },
            baseline_cumulative_time: None,
            initial_target_samples: 0,
        };
        assert!(!pending.expired(39_000));
        assert!(pending.expired(41_000));
    }
}
