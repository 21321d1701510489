//! Global bandwidth limiting for chunk streams
//!
//! Every chunk task draws from one shared token bucket before it writes a
//! block, so the configured limit applies to the sum of all transfers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for tokens, so limit changes apply quickly
const MAX_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    /// Bytes per second, 0 = unlimited
    rate: u64,
    /// Bytes that may be transferred right now (at most one second's worth)
    tokens: f64,
    refilled: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled).as_secs_f64();
        self.refilled = now;
        let capacity = self.rate as f64;
        self.tokens = (self.tokens + elapsed * capacity).min(capacity);
    }

    /// Take up to `wanted` bytes; returns how many were granted
    fn take(&mut self, wanted: u64) -> u64 {
        let granted = (self.tokens.floor() as u64).min(wanted);
        self.tokens -= granted as f64;
        granted
    }
}

/// Token bucket shared by all downloads
///
/// Cloning yields another handle to the same bucket.
///
/// # Examples
///
/// ```
/// use rangedl::speed_limiter::SpeedLimiter;
///
/// let limiter = SpeedLimiter::new(Some(2 * 1024 * 1024));
/// assert_eq!(limiter.get_limit(), Some(2 * 1024 * 1024));
///
/// limiter.set_limit(None);
/// assert_eq!(limiter.get_limit(), None);
/// ```
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl SpeedLimiter {
    /// Create a limiter; `None` means unlimited
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let rate = limit_bps.unwrap_or(0);
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate,
                tokens: rate as f64,
                refilled: Instant::now(),
            })),
        }
    }

    /// Change the limit at runtime
    ///
    /// Raising the limit tops the bucket up to the new capacity; lowering it
    /// trims surplus tokens.
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        let rate = limit_bps.unwrap_or(0);
        if rate > bucket.rate {
            bucket.tokens = rate as f64;
        } else {
            bucket.tokens = bucket.tokens.min(rate as f64);
        }
        bucket.rate = rate;
        tracing::debug!(limit_bps = ?limit_bps, "speed limit changed");
    }

    /// Current limit in bytes per second, `None` if unlimited
    pub fn get_limit(&self) -> Option<u64> {
        match self.bucket.lock().rate {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Wait until `bytes` may be transferred
    ///
    /// Partial grants are consumed as they become available, so a request
    /// larger than the bucket still completes.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.rate == 0 {
                    return;
                }
                bucket.refill(Instant::now());
                remaining -= bucket.take(remaining);
                if remaining == 0 {
                    return;
                }
                Duration::from_secs_f64(remaining as f64 / bucket.rate as f64)
            };
            tokio::time::sleep(wait.clamp(Duration::from_millis(5), MAX_WAIT)).await;
        }
    }
}
