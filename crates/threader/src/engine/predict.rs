//! Load prediction for candidate thread counts
//!
//! Projects what the host would look like at a different concurrency level.
//! With little history the projection is a naive linear scaling; with enough
//! history it uses the median per-thread impact observed during similar,
//! stable periods; otherwise a fixed power-law damping.

use crate::config::HighThresholds;
use crate::models::PerfPoint;

/// Perf points required before the similarity path is considered.
const MIN_POINTS: usize = 10;

/// Similar periods required for the median-impact path.
const MIN_SIMILAR: usize = 3;

/// Default per-thread impacts when no thread-count changes were observed.
const DEFAULT_CPU_IMPACT: f64 = 3.0;
const DEFAULT_TEMP_IMPACT: f64 = 1.0;
const DEFAULT_MEM_IMPACT: f64 = 2.0;

/// Predicted host load at a candidate thread count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadPrediction {
    pub cpu: Option<f64>,
    pub temp: Option<f64>,
    pub mem: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub gpu_temp: Option<f64>,
    pub confidence: f64,
}

/// Predict host load at `threads` from recent performance history.
pub fn predict_load_with_threads(
    points: &[PerfPoint],
    threads: u32,
    thresholds: &HighThresholds,
) -> LoadPrediction {
    let Some(last) = points.last() else {
        return LoadPrediction {
            confidence: 0.0,
            ..Default::default()
        };
    };

    let last_threads = last.thread_count.max(1) as f64;
    let ratio = threads.max(1) as f64 / last_threads;
    let gpu_usage = last.sample.gpu_usage.map(|v| (v * ratio).min(100.0));
    let gpu_temp = last.sample.gpu_temp.map(|v| v * ratio.powf(0.5));

    if points.len() < MIN_POINTS {
        return LoadPrediction {
            cpu: last.sample.cpu_usage.map(|v| v * ratio),
            temp: last.sample.cpu_temp.map(|v| v + (ratio - 1.0) * 5.0),
            mem: last.sample.mem_usage.map(|v| v * ratio.sqrt()),
            gpu_usage,
            gpu_temp,
            confidence: 0.3,
        };
    }

    let similar = similar_stable_periods(points, last, thresholds);
    if similar.len() >= MIN_SIMILAR {
        let delta = threads.max(1) as f64 - last_threads;
        let cpu_impact = median_impact(&similar, |p| p.sample.cpu_usage).unwrap_or(DEFAULT_CPU_IMPACT);
        let temp_impact =
            median_impact(&similar, |p| p.sample.cpu_temp).unwrap_or(DEFAULT_TEMP_IMPACT);
        let mem_impact =
            median_impact(&similar, |p| p.sample.mem_usage).unwrap_or(DEFAULT_MEM_IMPACT);

        return LoadPrediction {
            cpu: last.sample.cpu_usage.map(|v| v + cpu_impact * delta),
            temp: last.sample.cpu_temp.map(|v| v + temp_impact * delta),
            mem: last.sample.mem_usage.map(|v| v + mem_impact * delta),
            gpu_usage,
            gpu_temp,
            confidence: (similar.len() as f64 / 10.0).min(0.9),
        };
    }

    // Power-law damping: load grows sublinearly with concurrency.
    LoadPrediction {
        cpu: last.sample.cpu_usage.map(|v| v * ratio.powf(0.8)),
        temp: last.sample.cpu_temp.map(|v| v * ratio.powf(0.6)),
        mem: last.sample.mem_usage.map(|v| v * ratio.powf(0.7)),
        gpu_usage,
        gpu_temp,
        confidence: 0.4,
    }
}

/// Stable points whose load resembles the current one.
fn similar_stable_periods<'a>(
    points: &'a [PerfPoint],
    last: &PerfPoint,
    thresholds: &HighThresholds,
) -> Vec<&'a PerfPoint> {
    let (Some(last_cpu), Some(last_temp)) = (last.sample.cpu_usage, last.sample.cpu_temp) else {
        return Vec::new();
    };

    points
        .iter()
        .filter(|p| {
            let (Some(cpu), Some(temp)) = (p.sample.cpu_usage, p.sample.cpu_temp) else {
                return false;
            };
            let stable = cpu < thresholds.cpu_usage && temp < thresholds.cpu_temp;
            stable && (cpu - last_cpu).abs() < 20.0 && (temp - last_temp).abs() < 10.0
        })
        .collect()
}

/// Median of per-thread metric deltas across consecutive similar points
/// whose thread count changed.
fn median_impact(points: &[&PerfPoint], metric: impl Fn(&PerfPoint) -> Option<f64>) -> Option<f64> {
    let mut impacts: Vec<f64> = points
        .windows(2)
        .filter_map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            let dt = b.thread_count as f64 - a.thread_count as f64;
            if dt == 0.0 {
                return None;
            }
            Some((metric(b)? - metric(a)?) / dt)
        })
        .collect();

    if impacts.is_empty() {
        return None;
    }
    impacts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(impacts[impacts.len() / 2])
}
