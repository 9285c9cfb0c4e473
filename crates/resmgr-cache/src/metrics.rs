//! A bounded, time-stamped sample buffer with an exponentially weighted
//! moving average, used for per-container usage series.

use std::{
    collections::VecDeque,
    time::{Duration, SystemTime},
};

/// Number of samples before [`MetricsRing::ewma`] reports a value.
const EWMA_WARMUP: u64 = 10;

/// Fixed-capacity ring of `(timestamp, value)` samples, oldest first.
#[derive(Clone, Debug)]
pub struct MetricsRing {
    capacity: usize,
    samples: VecDeque<(SystemTime, f64)>,
    ewma: f64,
    alpha: f64,
    pushed: u64,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
            ewma: 0.0,
            // Standard N-period smoothing over the ring capacity.
            alpha: 2.0 / (capacity.max(1) as f64 + 1.0),
            pushed: 0,
        }
    }

    /// Appends a sample with the current wall-clock time, dropping the
    /// oldest sample beyond capacity.
    pub fn push(&mut self, value: f64) {
        self.push_at(SystemTime::now(), value);
    }

    fn push_at(&mut self, at: SystemTime, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));

        self.ewma = match self.pushed {
            0 => value,
            _ => self.alpha * value + (1.0 - self.alpha) * self.ewma,
        };
        self.pushed += 1;
    }

    /// The moving average, or 0.0 while fewer than the warmup count of
    /// samples have been pushed.
    pub fn ewma(&self) -> f64 {
        if self.pushed < EWMA_WARMUP {
            return 0.0;
        }
        self.ewma
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration between the oldest and newest retained sample.
    pub fn span(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some((oldest, _)), Some((newest, _))) => {
                newest.duration_since(*oldest).unwrap_or_default()
            }
            _ => Duration::ZERO,
        }
    }

    /// The most recent `min(k, len)` sample values, oldest first.
    pub fn last_n(&self, k: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(k);
        self.samples.iter().skip(skip).map(|(_, v)| *v).collect()
    }
}
