//! Three-state circuit breaker gating dispatch to the upstream API
//!
//! State transitions:
//! - `Closed` → `Open`:      recent failures reach `failure_threshold`
//! - `Open` → `HalfOpen`:    `reset_timeout` has elapsed; the transition
//!   happens inside `allow_request`, not on a background timer
//! - `HalfOpen` → `Closed`:  `success_threshold` consecutive probe successes
//! - `HalfOpen` → `Open`:    a single probe failure
//!
//! Failure counting in `Closed` is windowed: a quiet gap longer than
//! `failure_window` since the previous failure restarts the count, so stale
//! failures never accumulate toward the threshold.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// All requests refused until `reset_timeout` elapses
    Open,
    /// Probe requests allowed to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

/// Thread-safe circuit breaker; cloning yields a handle to the same circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Creates a new breaker in `Closed` state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_failure_at: None,
            })),
        }
    }

    /// Returns `true` if a request may be attempted right now.
    ///
    /// When `Open` and `reset_timeout` has elapsed, this call itself moves
    /// the breaker to `HalfOpen` and returns `true`.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!("circuit breaker half-open, probing upstream");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a completed attempt that succeeded.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.last_failure_at = None;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.last_failure_at = None;
                    info!("circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a completed attempt that failed terminally.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                // A quiet gap longer than the window restarts the count.
                if let Some(last) = inner.last_failure_at {
                    if now.duration_since(last) > self.config.failure_window {
                        inner.failure_count = 0;
                    }
                }
                inner.failure_count += 1;
                inner.last_failure_at = Some(now);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        failures = inner.failure_count,
                        "circuit breaker open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.success_count = 0;
                warn!("circuit breaker probe failed, reopening");
            }
            CircuitState::Open => {}
        }
    }

    /// Remaining time until an `Open` breaker will allow a probe; zero when
    /// not `Open`.
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.reset_timeout.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    /// Current state, without performing any transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Forces `Closed` with all counters zeroed, from any state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.last_failure_at = None;
        info!("circuit breaker reset");
    }
}
