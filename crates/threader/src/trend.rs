//! Trend analysis over telemetry history
//!
//! Pure functions: least-squares slope, recent rate of change, time-to-
//! threshold prediction, operation-mix drift, and the rule-based trend
//! recommendation the decision engine blends in.

use crate::config::HighThresholds;
use crate::models::{OperationMix, TelemetrySample};

/// Points required before the recommendation leaves `insufficient_data`.
const MIN_POINTS: usize = 10;

/// Window for the rate-of-change estimate.
const RATE_WINDOW: usize = 10;

/// Mix snapshots considered by `operation_mix_diff`.
const MIX_WINDOW: usize = 5;

/// Seconds-to-threshold below which a pre-emptive scale-down fires.
const THRESHOLD_HORIZON_SEC: f64 = 30.0;

/// Least-squares slope of `values` over indices 0..n-1.
pub fn slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_x2: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();
    let denom = n * sum_x2 - sum_x.powi(2);
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

/// Mean of successive differences over the last `RATE_WINDOW` values,
/// in value units per step.
pub fn rate_of_change(values: &[f64]) -> f64 {
    let window = &values[values.len().saturating_sub(RATE_WINDOW)..];
    if window.len() < 2 {
        return 0.0;
    }
    let sum: f64 = window.windows(2).map(|w| w[1] - w[0]).sum();
    sum / (window.len() - 1) as f64
}

/// Time until `current` reaches `threshold` at `rate` per second.
///
/// Absent when the value is not rising or already past the threshold.
pub fn predict_time_to_threshold(current: f64, rate: f64, threshold: f64) -> Option<f64> {
    if rate > 0.0 && current < threshold {
        Some((threshold - current) / rate)
    } else {
        None
    }
}

/// Change between two consecutive operation-mix snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct MixDelta {
    pub new_types: Vec<String>,
    pub removed_types: Vec<String>,
    /// Total-intensity delta, current minus previous.
    pub intensity_change: f64,
}

/// Per-step mix drift over the last `MIX_WINDOW` snapshots.
pub fn operation_mix_diff(mixes: &[OperationMix]) -> Vec<MixDelta> {
    let window = &mixes[mixes.len().saturating_sub(MIX_WINDOW)..];
    window
        .windows(2)
        .map(|pair| {
            let (prev, curr) = (&pair[0], &pair[1]);
            MixDelta {
                new_types: curr
                    .0
                    .keys()
                    .filter(|k| !prev.0.contains_key(*k))
                    .cloned()
                    .collect(),
                removed_types: prev
                    .0
                    .keys()
                    .filter(|k| !curr.0.contains_key(*k))
                    .cloned()
                    .collect(),
                intensity_change: curr.total_intensity() - prev.total_intensity(),
            }
        })
        .collect()
}

/// What the trend suggests doing with the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendAction {
    ScaleDown,
    ScaleUp,
    Maintain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Rule-based recommendation over recent telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendRecommendation {
    pub action: TrendAction,
    pub urgency: Option<Urgency>,
    pub confidence: f64,
    pub reason: &'static str,
}

/// Evaluate the trend rules against recent samples.
pub fn recommendation(
    samples: &[TelemetrySample],
    thresholds: &HighThresholds,
) -> TrendRecommendation {
    if samples.len() < MIN_POINTS {
        return TrendRecommendation {
            action: TrendAction::Maintain,
            urgency: None,
            confidence: 0.3,
            reason: "insufficient_data",
        };
    }

    let cpu_series: Vec<f64> = samples.iter().filter_map(|s| s.cpu_usage).collect();
    let temp_series: Vec<f64> = samples.iter().filter_map(|s| s.cpu_temp).collect();
    let current_cpu = cpu_series.last().copied();
    let current_temp = temp_series.last().copied();

    let cpu_high = current_cpu.is_some_and(|c| c > thresholds.cpu_usage);
    let temp_high = current_temp.is_some_and(|t| t > thresholds.cpu_temp);
    if cpu_high || temp_high {
        return TrendRecommendation {
            action: TrendAction::ScaleDown,
            urgency: Some(Urgency::High),
            confidence: 0.9,
            reason: "resource_pressure",
        };
    }

    if let Some(current) = current_cpu {
        let rate_per_sec = rate_of_change(&cpu_series) / mean_step_sec(samples);
        if let Some(ttc) = predict_time_to_threshold(current, rate_per_sec, thresholds.cpu_usage) {
            if ttc < THRESHOLD_HORIZON_SEC {
                return TrendRecommendation {
                    action: TrendAction::ScaleDown,
                    urgency: Some(Urgency::Medium),
                    confidence: 0.7,
                    reason: "approaching_cpu_threshold",
                };
            }
        }
    }

    let cool = current_cpu.is_some_and(|c| c < 50.0)
        && current_temp.is_some_and(|t| t < 70.0)
        && slope(&cpu_series) < 0.0;
    if cool {
        return TrendRecommendation {
            action: TrendAction::ScaleUp,
            urgency: Some(Urgency::Low),
            confidence: 0.6,
            reason: "headroom_available",
        };
    }

    TrendRecommendation {
        action: TrendAction::Maintain,
        urgency: None,
        confidence: 0.5,
        reason: "stable",
    }
}

/// Mean seconds between samples, floored at one.
fn mean_step_sec(samples: &[TelemetrySample]) -> f64 {
    if samples.len() < 2 {
        return 1.0;
    }
    let span_ms = (samples[samples.len() - 1].ts - samples[0].ts).max(0) as f64;
    (span_ms / 1000.0 / (samples.len() - 1) as f64).max(1.0)
}
