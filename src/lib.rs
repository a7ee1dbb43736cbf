//! # sync-dispatch
//!
//! Resilient request dispatch for syncing saved content from a rate-limited
//! REST API. The crate provides a bounded-concurrency request orchestrator
//! composed of a circuit breaker, a token-bucket rate limiter reconcilable
//! with server-reported quotas, and a priority-aware offline buffer for
//! requests issued while disconnected.
//!
//! ## Core Concepts
//!
//! - **RequestQueue**: accepts requests, orders them by priority, and
//!   dispatches up to `max_concurrent` at a time with retry and capped
//!   exponential backoff
//! - **CircuitBreaker**: stops hammering a consistently failing endpoint and
//!   probes for recovery
//! - **RateLimiter**: a continuously refilling token bucket; server quota
//!   headers always win over local accounting
//! - **OfflineQueue**: bounded holding area drained, in priority order, when
//!   connectivity returns
//!
//! Callers only ever see a response or one terminal error per enqueue; all
//! retry, backoff and circuit logic stays internal.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use sync_dispatch::{ApiRequest, HttpTransport, RequestOptions, RequestQueue};
//!
//! # async fn example() -> sync_dispatch::Result<()> {
//! let queue = RequestQueue::builder(HttpTransport::new())
//!     .max_concurrent(2)
//!     .rate_limit(60, std::time::Duration::from_secs(60))
//!     .build();
//!
//! let response = queue
//!     .enqueue(
//!         ApiRequest::get("https://api.example.com/saved?page=1")
//!             .header("Authorization", "Bearer token"),
//!         RequestOptions::high(),
//!     )
//!     .await?;
//!
//! println!("fetched {} bytes", response.body.len());
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod offline;
pub mod queue;
pub mod rate_limit;
pub mod request;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{CircuitBreakerConfig, QueueConfig, RateLimitConfig};
pub use error::{DispatchError, Result};
pub use offline::{AddResult, OfflineQueue};
pub use queue::{RequestQueue, RequestQueueBuilder, QueueStatus, ResponseFuture};
pub use rate_limit::RateLimiter;
pub use request::{
    gen_request_id, ApiRequest, ApiResponse, HttpMethod, Priority, RequestId, RequestOptions,
};
pub use transport::HttpTransport;

// Re-export Tower traits needed to implement custom transports
pub use tower::{Service, ServiceExt};
