//! Sequential search over candidate thread counts
//!
//! Maximizes a reward function over a small integer interval by iterative
//! interval narrowing: evaluate the endpoints and midpoint, keep the half
//! containing the best candidate, repeat. Evaluations are memoized so the
//! iteration budget is spent on new candidates.

use std::collections::BTreeMap;

/// Result of one search run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOutcome {
    pub threads: u32,
    pub reward: f64,
}

/// Maximize `score` over `[lo, hi]` with the given iteration budget.
pub fn maximize(
    lo: u32,
    hi: u32,
    iterations: usize,
    mut score: impl FnMut(u32) -> f64,
) -> SearchOutcome {
    let lo = lo.max(1);
    let hi = hi.max(lo);
    let mut cache: BTreeMap<u32, f64> = BTreeMap::new();
    let mut eval = |t: u32, cache: &mut BTreeMap<u32, f64>| -> f64 {
        *cache.entry(t).or_insert_with(|| score(t))
    };

    let mut cur_lo = lo;
    let mut cur_hi = hi;
    for _ in 0..iterations {
        let mid = cur_lo + (cur_hi - cur_lo) / 2;
        for t in [cur_lo, mid, cur_hi] {
            eval(t, &mut cache);
        }

        let (best_t, _) = best_of(&cache);
        if cur_hi - cur_lo <= 1 {
            break;
        }
        if best_t <= mid {
            cur_hi = mid;
        } else {
            cur_lo = mid;
        }
    }

    let (threads, reward) = best_of(&cache);
    SearchOutcome { threads, reward }
}

fn best_of(cache: &BTreeMap<u32, f64>) -> (u32, f64) {
    cache
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(t, r)| (*t, *r))
        .unwrap_or((1, f64::NEG_INFINITY))
}
