//! Token-bucket rate limiter reconcilable with server-reported quotas
//!
//! The bucket refills continuously from elapsed wall-clock time rather than
//! on a fixed tick, so two acquisitions milliseconds apart observe
//! proportionally different availability. `update_from_headers` lets the
//! queue overwrite local accounting with the server's view of the quota,
//! which wins because other clients may share it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;

struct Bucket {
    max_tokens: f64,
    tokens: f64,
    /// Tokens regained per millisecond; recalibrated by server headers
    refill_per_ms: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Thread-safe token bucket; cloning yields a handle to the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Creates a full bucket refilling `max_requests` per `window`.
    pub fn new(config: RateLimitConfig) -> Self {
        let max_tokens = config.max_requests as f64;
        let window_ms = (config.window.as_secs_f64() * 1000.0).max(1.0);
        Self {
            inner: Arc::new(Mutex::new(Bucket {
                max_tokens,
                tokens: max_tokens,
                refill_per_ms: max_tokens / window_ms,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Debits one token if at least one is available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.inner.lock().unwrap();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next whole token at the current refill rate; zero if
    /// one is already available.
    pub fn wait_time(&self) -> Duration {
        let mut bucket = self.inner.lock().unwrap();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else if bucket.refill_per_ms <= 0.0 {
            // Starved until the server reports fresh quota.
            Duration::from_secs(1)
        } else {
            let ms = (1.0 - bucket.tokens) / bucket.refill_per_ms;
            Duration::from_secs_f64(ms / 1000.0)
        }
    }

    /// Current fractional token count, for diagnostics and status snapshots.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.inner.lock().unwrap();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Overwrites local accounting with the server-reported quota.
    ///
    /// Tokens become `remaining` (clamped to capacity) and the refill rate
    /// is re-aimed so the bucket returns to capacity `reset` from now. The
    /// recalibrated rate stays in effect until the next reconciliation;
    /// every response carrying quota headers corrects any drift.
    pub fn update_from_headers(&self, remaining: f64, reset: Duration) {
        let mut bucket = self.inner.lock().unwrap();
        let now = Instant::now();
        bucket.tokens = remaining.clamp(0.0, bucket.max_tokens);
        bucket.last_refill = now;

        let reset_ms = reset.as_secs_f64() * 1000.0;
        if reset_ms >= 1.0 && bucket.tokens < bucket.max_tokens {
            bucket.refill_per_ms = (bucket.max_tokens - bucket.tokens) / reset_ms;
        }
        debug!(
            remaining = bucket.tokens,
            reset_ms, "rate limiter reconciled from server headers"
        );
    }
}
