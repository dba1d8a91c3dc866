//! Token-bucket throttle for snapshot streaming.

use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const DEFAULT_INTERVAL_MS: u64 = 100;

/// Byte-budget limiter refilled once per interval.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes granted per interval.
    rate: u64,
    /// Bytes left in the current interval.
    tokens: u64,
    interval_start: Instant,
    interval: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `bytes_per_sec`, refilled every
    /// `interval_ms`. Intervals outside `[5, 1000]` fall back to 100ms.
    pub fn new(bytes_per_sec: u64, interval_ms: u64) -> Self {
        let interval_ms = if (5..=1000).contains(&interval_ms) {
            interval_ms
        } else {
            DEFAULT_INTERVAL_MS
        };
        let mut limiter = Self {
            rate: bytes_per_sec * interval_ms / 1000,
            tokens: 0,
            interval_start: Instant::now(),
            interval: Duration::from_millis(interval_ms),
        };
        limiter.reset();
        limiter
    }

    /// Refill the bucket and start a new interval.
    pub fn reset(&mut self) {
        self.tokens = self.rate;
        self.interval_start = Instant::now();
    }

    /// Bytes granted per interval.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take `size` bytes from the bucket, sleeping until enough are available.
    pub async fn get_token(&mut self, size: u64) {
        if self.tokens >= size {
            self.tokens -= size;
            return;
        }

        let mut size = size - self.tokens;
        let elapsed = self.interval_start.elapsed();
        if elapsed < self.interval {
            let wait = self.interval - elapsed;
            trace!(?wait, "Rate limiter sleeping");
            tokio::time::sleep(wait).await;
        }
        self.reset();

        // A single request larger than the bucket drains several intervals.
        while self.tokens < size {
            if self.rate == 0 {
                size = self.tokens;
                break;
            }
            trace!(wait = ?self.interval, "Rate limiter sleeping");
            tokio::time::sleep(self.interval).await;
            self.tokens += self.rate;
            self.interval_start = Instant::now();
        }
        self.tokens -= size;
    }
}
