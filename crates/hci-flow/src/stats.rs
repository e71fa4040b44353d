//! # Retirement Statistics Log
//!
//! Bounded history of retired transfers and quantile queries over it.
//!
//! Samples land in a fixed-capacity circular buffer: appends are O(1), and once
//! `max_depth` samples have been recorded the logically oldest slot is
//! overwritten. Quantiles are answered by partial selection over a reused
//! scratch buffer rather than by sorting the whole history.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("max_depth must be at least 1")]
    ZeroCapacity,
    #[error("min_depth {min_depth} exceeds max_depth {max_depth}")]
    MinExceedsMax { min_depth: usize, max_depth: usize },
}

// ─── RetiredSample ───────────────────────────────────────────────────────────

/// One completed transfer: how big it was and how long it lived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetiredSample {
    pub byte_count: u64,
    pub age: Duration,
}

// ─── RetirementLog ───────────────────────────────────────────────────────────

/// Circular sample history with high-biased quantile queries.
#[derive(Debug, Clone)]
pub struct RetirementLog {
    min_depth: usize,
    max_depth: usize,
    samples: Vec<RetiredSample>,
    /// Slot overwritten by the next retirement once the buffer is full.
    next_slot: usize,
    byte_scratch: Vec<u64>,
    age_scratch: Vec<Duration>,
}

impl RetirementLog {
    /// Create a log answering queries once `min_depth` samples exist and
    /// keeping at most `max_depth` of them.
    pub fn new(min_depth: usize, max_depth: usize) -> Result<Self, StatsError> {
        if max_depth == 0 {
            return Err(StatsError::ZeroCapacity);
        }
        if min_depth > max_depth {
            return Err(StatsError::MinExceedsMax {
                min_depth,
                max_depth,
            });
        }
        Ok(RetirementLog {
            min_depth,
            max_depth,
            samples: Vec::with_capacity(max_depth),
            next_slot: 0,
            byte_scratch: Vec::with_capacity(max_depth),
            age_scratch: Vec::with_capacity(max_depth),
        })
    }

    /// Record one retired transfer.
    pub fn retire(&mut self, byte_count: u64, age: Duration) {
        let sample = RetiredSample { byte_count, age };
        if self.samples.len() < self.max_depth {
            self.samples.push(sample);
        } else {
            self.samples[self.next_slot] = sample;
            self.next_slot = (self.next_slot + 1) % self.max_depth;
        }
    }

    /// Number of samples currently held.
    pub fn depth(&self) -> usize {
        self.samples.len()
    }

    pub fn min_depth(&self) -> usize {
        self.min_depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Whether quantile queries currently produce values.
    pub fn is_queryable(&self) -> bool {
        self.depth() >= self.min_depth.max(1)
    }

    /// Forget all history. Scratch capacity is kept.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.next_slot = 0;
    }

    /// Byte-count value at each cut point, in the order the cut points were
    /// given. `None` while fewer than `min_depth` samples exist.
    pub fn byte_count_quantiles(&mut self, partitions: &[f64]) -> Option<Vec<u64>> {
        if !self.is_queryable() {
            return None;
        }
        self.byte_scratch.clear();
        self.byte_scratch
            .extend(self.samples.iter().map(|s| s.byte_count));
        Some(select_quantiles(&mut self.byte_scratch, partitions))
    }

    /// Age value at each cut point, in the order the cut points were given.
    /// `None` while fewer than `min_depth` samples exist.
    pub fn age_quantiles(&mut self, partitions: &[f64]) -> Option<Vec<Duration>> {
        if !self.is_queryable() {
            return None;
        }
        self.age_scratch.clear();
        self.age_scratch.extend(self.samples.iter().map(|s| s.age));
        Some(select_quantiles(&mut self.age_scratch, partitions))
    }
}

// ─── Selection ───────────────────────────────────────────────────────────────

/// Clamp a cut point into `[0, 1]`; NaN maps to 0.
fn normalize_partition(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// Rank selected for cut point `p` over `depth` values. Rounds down, so an
/// exact boundary picks the upper neighbour (depth 2, p 0.5 → rank 1).
fn quantile_rank(depth: usize, p: f64) -> usize {
    let k = (depth as f64 * p).floor() as usize;
    k.min(depth - 1)
}

/// Place the requested ranks of `values` and read them back in caller order.
///
/// Cut points are visited in ascending order so each selection only has to
/// search the window to the right of the previous one; everything left of
/// that point is already known to be no larger.
fn select_quantiles<T: Ord + Copy>(values: &mut [T], partitions: &[f64]) -> Vec<T> {
    debug_assert!(!values.is_empty());
    let depth = values.len();

    let mut order: Vec<(f64, usize)> = partitions
        .iter()
        .map(|&p| normalize_partition(p))
        .enumerate()
        .map(|(pos, p)| (p, pos))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut out: Vec<Option<T>> = vec![None; partitions.len()];
    let mut window_start = 0;
    for (p, pos) in order {
        let k = quantile_rank(depth, p);
        let window = &mut values[window_start..];
        window.select_nth_unstable(k - window_start);
        out[pos] = Some(values[k]);
        window_start = k;
    }

    out.into_iter().flatten().collect()
}
