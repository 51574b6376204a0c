//! Bounded telemetry and performance history
//!
//! Three rings with FIFO eviction: telemetry samples (bounded by age and
//! count), performance points and demand points (bounded by count). The
//! supervisor is the only writer; readers get cloned snapshots.

use crate::models::{DemandPoint, PerfPoint, TelemetrySample};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Demand ring bound.
const MAX_DEMAND_POINTS: usize = 50;

/// Summary metric statistics over the defined values of one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// How many samples carried this field.
    pub defined: usize,
}

/// Aggregate view over the telemetry ring.
#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub data_points: usize,
    pub time_span_sec: f64,
    pub cpu_usage: Option<MetricStats>,
    pub cpu_temp: Option<MetricStats>,
    pub mem_usage: Option<MetricStats>,
    pub gpu_usage: Option<MetricStats>,
    pub gpu_temp: Option<MetricStats>,
}

struct Rings {
    telemetry: VecDeque<TelemetrySample>,
    performance: VecDeque<PerfPoint>,
    demand: VecDeque<DemandPoint>,
}

/// Bounded in-memory history store.
pub struct HistoryStore {
    max_age_ms: i64,
    max_data_points: usize,
    max_performance: usize,
    rings: Mutex<Rings>,
}

impl HistoryStore {
    pub fn new(max_age_minutes: u64, max_data_points: usize, max_performance: usize) -> Self {
        Self {
            max_age_ms: (max_age_minutes * 60 * 1000) as i64,
            max_data_points: max_data_points.max(1),
            max_performance: max_performance.max(1),
            rings: Mutex::new(Rings {
                telemetry: VecDeque::new(),
                performance: VecDeque::new(),
                demand: VecDeque::new(),
            }),
        }
    }

    /// Append one telemetry sample, evicting by age then count.
    pub fn append_sample(&self, sample: TelemetrySample) {
        let mut rings = self.rings.lock().expect("history mutex poisoned");
        Self::evict_telemetry(&mut rings.telemetry, sample.ts, self.max_age_ms);
        while rings.telemetry.len() >= self.max_data_points {
            rings.telemetry.pop_front();
        }
        rings.telemetry.push_back(sample);
    }

    /// Append one performance point.
    pub fn append_perf(&self, point: PerfPoint) {
        let mut rings = self.rings.lock().expect("history mutex poisoned");
        while rings.performance.len() >= self.max_performance {
            rings.performance.pop_front();
        }
        rings.performance.push_back(point);
    }

    /// Append one demand point.
    pub fn append_demand(&self, point: DemandPoint) {
        let mut rings = self.rings.lock().expect("history mutex poisoned");
        while rings.demand.len() >= MAX_DEMAND_POINTS {
            rings.demand.pop_front();
        }
        rings.demand.push_back(point);
    }

    /// Telemetry samples within the trailing window.
    pub fn recent(&self, window_sec: u64) -> Vec<TelemetrySample> {
        let rings = self.rings.lock().expect("history mutex poisoned");
        let newest = match rings.telemetry.back() {
            Some(s) => s.ts,
            None => return Vec::new(),
        };
        let cutoff = newest - (window_sec * 1000) as i64;
        rings
            .telemetry
            .iter()
            .filter(|s| s.ts >= cutoff)
            .cloned()
            .collect()
    }

    /// All retained telemetry samples, after a lazy age-based eviction pass.
    pub fn all(&self) -> Vec<TelemetrySample> {
        let mut rings = self.rings.lock().expect("history mutex poisoned");
        if let Some(newest) = rings.telemetry.back().map(|s| s.ts) {
            Self::evict_telemetry(&mut rings.telemetry, newest, self.max_age_ms);
        }
        rings.telemetry.iter().cloned().collect()
    }

    /// Snapshot of the performance ring, oldest first.
    pub fn perf_points(&self) -> Vec<PerfPoint> {
        let rings = self.rings.lock().expect("history mutex poisoned");
        rings.performance.iter().cloned().collect()
    }

    /// Snapshot of the demand ring, oldest first.
    pub fn demand_points(&self) -> Vec<DemandPoint> {
        let rings = self.rings.lock().expect("history mutex poisoned");
        rings.demand.iter().cloned().collect()
    }

    /// Aggregate statistics over the telemetry ring.
    pub fn stats(&self) -> HistoryStats {
        let samples = self.all();
        let mut stats = HistoryStats {
            data_points: samples.len(),
            ..Default::default()
        };
        if let (Some(first), Some(last)) = (samples.first(), samples.last()) {
            stats.time_span_sec = (last.ts - first.ts).max(0) as f64 / 1000.0;
        }

        stats.cpu_usage = metric_stats(samples.iter().filter_map(|s| s.cpu_usage));
        stats.cpu_temp = metric_stats(samples.iter().filter_map(|s| s.cpu_temp));
        stats.mem_usage = metric_stats(samples.iter().filter_map(|s| s.mem_usage));
        stats.gpu_usage = metric_stats(samples.iter().filter_map(|s| s.gpu_usage));
        stats.gpu_temp = metric_stats(samples.iter().filter_map(|s| s.gpu_temp));
        stats
    }

    fn evict_telemetry(ring: &mut VecDeque<TelemetrySample>, now_ms: i64, max_age_ms: i64) {
        let cutoff = now_ms - max_age_ms;
        while ring.front().is_some_and(|s| s.ts < cutoff) {
            ring.pop_front();
        }
    }
}

/// Average/min/max over defined values only; `None` when nothing is defined.
fn metric_stats(values: impl Iterator<Item = f64>) -> Option<MetricStats> {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for v in values {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }

    if count == 0 {
        return None;
    }
    Some(MetricStats {
        average: sum / count as f64,
        min,
        max,
        defined: count,
    })
}
