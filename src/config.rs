//! Configuration for the request queue and its policies
//!
//! All knobs are plain serde-friendly structs so a host application can load
//! them from its own settings file and hand them to [`RequestQueue::new`] or
//! the builder.
//!
//! [`RequestQueue::new`]: crate::RequestQueue::new

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a [`RequestQueue`](crate::RequestQueue)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of concurrently dispatching requests
    pub max_concurrent: usize,

    /// Timeout applied to a network attempt unless the request overrides it
    pub default_timeout: Duration,

    /// Additional attempts allowed after the first (a request performs at
    /// most `max_retries + 1` network calls)
    pub max_retries: u32,

    /// Delay before the first retry; doubles per attempt
    pub base_backoff: Duration,

    /// Upper bound on any computed backoff delay
    pub max_backoff: Duration,

    /// Local rate-limit policy
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker policy
    pub circuit_breaker: CircuitBreakerConfig,

    /// Capacity of the offline holding queue
    pub offline_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            offline_queue_size: 100,
        }
    }
}

impl QueueConfig {
    /// Exponential backoff for the given zero-based attempt number, capped
    /// at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff)
    }
}

/// Token bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window (also the bucket capacity)
    pub max_requests: u32,

    /// Window over which `max_requests` refill
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Recent failures that trip the breaker open
    pub failure_threshold: u32,

    /// How long to stay open before allowing a probe
    pub reset_timeout: Duration,

    /// Consecutive half-open successes required to close again
    pub success_threshold: u32,

    /// A quiet gap longer than this resets the failure count
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 2,
            failure_window: Duration::from_secs(60),
        }
    }
}
