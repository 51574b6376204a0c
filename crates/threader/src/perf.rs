//! Per-thread-count performance tracking
//!
//! Keeps a bounded sample window per concurrency level and compares levels
//! by an efficiency score that rewards throughput and punishes cumulative
//! time regressions against the next-lower level. The winning level becomes
//! the optimum cap for subsequent exploration.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use tracing::debug;

/// Samples retained per concurrency level.
const WINDOW_SIZE: usize = 20;

/// Floor divisor guard for cumulative-time computation.
const MIN_THROUGHPUT: f64 = 1e-6;

/// One normalized observation at a concurrency level.
#[derive(Debug, Clone, Copy)]
pub struct LevelSample {
    pub throughput: f64,
    pub latency_ms: f64,
    pub cumulative_time: f64,
    pub backlog: f64,
}

/// Averages over one level's window.
#[derive(Debug, Clone, Copy)]
pub struct LevelAverages {
    pub throughput: f64,
    pub latency_ms: f64,
    pub cumulative_time: f64,
    pub samples: usize,
}

/// Per-thread-count sample windows and the locked-in optimum.
#[derive(Debug, Default)]
pub struct ThreadPerf {
    windows: BTreeMap<u32, VecDeque<LevelSample>>,
    optimal: Option<u32>,
}

impl ThreadPerf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tick's measurement at `thread_count`.
    ///
    /// Ignored unless both throughput and latency were measured; a zero
    /// measured throughput falls back to `thread_count / latency_sec`.
    pub fn record(
        &mut self,
        thread_count: u32,
        throughput: Option<f64>,
        latency_ms: Option<f64>,
        backlog: Option<f64>,
    ) {
        let (Some(measured), Some(latency_ms)) = (throughput, latency_ms) else {
            return;
        };
        let thread_count = thread_count.max(1);
        let latency_sec = latency_ms.max(1.0) / 1000.0;
        let effective = if measured > 0.0 {
            measured
        } else {
            thread_count as f64 / latency_sec
        };
        let backlog = backlog.unwrap_or(thread_count as f64).max(1.0);
        let cumulative_time = backlog / effective.max(MIN_THROUGHPUT);

        let window = self.windows.entry(thread_count).or_default();
        while window.len() >= WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(LevelSample {
            throughput: effective,
            latency_ms,
            cumulative_time,
            backlog,
        });
    }

    pub fn samples_at(&self, level: u32) -> usize {
        self.windows.get(&level).map_or(0, VecDeque::len)
    }

    /// Concurrency levels with at least one sample, ascending.
    pub fn levels(&self) -> Vec<u32> {
        self.windows
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(l, _)| *l)
            .collect()
    }

    /// Highest level observed so far.
    pub fn max_observed_level(&self) -> Option<u32> {
        self.levels().last().copied()
    }

    pub fn averages(&self, level: u32) -> Option<LevelAverages> {
        let window = self.windows.get(&level)?;
        if window.is_empty() {
            return None;
        }
        let n = window.len() as f64;
        Some(LevelAverages {
            throughput: window.iter().map(|s| s.throughput).sum::<f64>() / n,
            latency_ms: window.iter().map(|s| s.latency_ms).sum::<f64>() / n,
            cumulative_time: window.iter().map(|s| s.cumulative_time).sum::<f64>() / n,
            samples: window.len(),
        })
    }

    /// Coefficient of variation of cumulative time at `level`.
    pub fn cumulative_time_cov(&self, level: u32) -> Option<f64> {
        let window = self.windows.get(&level)?;
        if window.len() < 2 {
            return None;
        }
        let n = window.len() as f64;
        let mean = window.iter().map(|s| s.cumulative_time).sum::<f64>() / n;
        if mean.abs() < f64::EPSILON {
            return Some(0.0);
        }
        let var = window
            .iter()
            .map(|s| (s.cumulative_time - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        Some(var.sqrt() / mean)
    }

    /// Efficiency score for a level; higher is better.
    pub fn efficiency(&self, level: u32) -> Option<f64> {
        let avg = self.averages(level)?;
        let latency_sec = avg.latency_ms / 1000.0;

        let mut eff = -avg.cumulative_time + (avg.throughput + 1.0).ln()
            - 0.1 * (latency_sec + 1.0).ln()
            - 0.02 * (level as f64 + 1.0).ln();

        // Regression penalties against the next-lower level with data.
        if let Some(prev) = self.next_lower_with_data(level) {
            if avg.cumulative_time > prev.cumulative_time * 1.03 {
                eff -= 5.0 * (avg.cumulative_time - prev.cumulative_time);
            }
            if avg.throughput < prev.throughput * 0.97 {
                eff -= 10.0 * (prev.throughput - avg.throughput);
            }
            if avg.latency_ms > prev.latency_ms * 1.05 {
                eff -= 5.0 * ((avg.latency_ms - prev.latency_ms) / 1000.0);
            }
        }

        Some(eff)
    }

    /// Re-evaluate the optimum across levels with enough samples.
    ///
    /// `history_len` is the performance-history length; the per-level
    /// quorum is `max(5, ceil(history_len * 0.05))`. An incumbent is only
    /// displaced by a margin of `max(5, 0.02 * max(|prev|, |next|, 1))`.
    pub fn update_optimal(&mut self, history_len: usize) -> Option<u32> {
        let min_samples = 5usize.max((history_len as f64 * 0.05).ceil() as usize);

        let candidate = self
            .levels()
            .into_iter()
            .filter(|l| self.samples_at(*l) >= min_samples)
            .filter_map(|l| self.efficiency(l).map(|e| (l, e)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some((level, eff)) = candidate else {
            return self.optimal;
        };

        match self.optimal {
            None => {
                debug!(level, eff, "Locking in initial optimal thread count");
                self.optimal = Some(level);
            }
            Some(prev) if prev != level => {
                let prev_eff = self.efficiency(prev).unwrap_or(f64::NEG_INFINITY);
                let margin = 5.0_f64.max(0.02 * prev_eff.abs().max(eff.abs()).max(1.0));
                if eff > prev_eff + margin {
                    debug!(
                        from = prev,
                        to = level,
                        margin,
                        "Optimal thread count displaced"
                    );
                    self.optimal = Some(level);
                }
            }
            Some(_) => {}
        }

        self.optimal
    }

    /// The locked-in optimum, when known.
    pub fn optimal(&self) -> Option<u32> {
        self.optimal
    }

    fn next_lower_with_data(&self, level: u32) -> Option<LevelAverages> {
        self.windows
            .range(..level)
            .rev()
            .find(|(_, w)| !w.is_empty())
            .and_then(|(l, _)| self.averages(*l))
    }
}
