//! Per-chunk throughput estimate

use std::time::{Duration, Instant};

/// Time constant of the moving average
const WINDOW: Duration = Duration::from_secs(2);

/// Exponentially decaying bytes-per-second counter
///
/// Bytes are accumulated between samples; each [`sample`](Self::sample) folds
/// the rate observed since the previous one into the average, weighted by
/// how much time passed.
#[derive(Debug, Clone)]
pub(crate) struct SpeedCounter {
    rate: f64,
    pending: u64,
    last: Instant,
}

impl SpeedCounter {
    pub(crate) fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub(crate) fn starting_at(now: Instant) -> Self {
        Self {
            rate: 0.0,
            pending: 0,
            last: now,
        }
    }

    pub(crate) fn add(&mut self, bytes: u64) {
        self.pending += bytes;
    }

    pub(crate) fn sample(&mut self) -> f64 {
        self.sample_at(Instant::now())
    }

    pub(crate) fn sample_at(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed <= 0.0 {
            return self.rate;
        }
        let observed = self.pending as f64 / elapsed;
        let alpha = 1.0 - (-elapsed / WINDOW.as_secs_f64()).exp();
        self.rate += alpha * (observed - self.rate);
        self.pending = 0;
        self.last = now;
        self.rate
    }
}
