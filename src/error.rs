//! Error types for the dispatch subsystem

use std::time::Duration;

use thiserror::Error;

/// Result type alias for the dispatch subsystem
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Terminal error delivered through a request's outcome future.
///
/// Retry, backoff and circuit logic are handled inside the queue; a caller
/// only ever observes a response or exactly one of these per enqueue.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Connection, DNS or body I/O failure
    #[error("network error: {0}")]
    Network(String),

    /// The effective request timeout elapsed
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    /// HTTP 429 from the server
    #[error("rate limited by server (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx from the server
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    /// HTTP 4xx other than 429; surfaced immediately, never retried
    #[error("client error: HTTP {status}")]
    Client { status: u16 },

    /// Synthesized locally when the circuit breaker refuses the attempt
    #[error("circuit breaker open (retry in {retry_in:?})")]
    CircuitOpen { retry_in: Duration },

    /// A retryable error persisted past the configured retry budget
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DispatchError>,
    },

    /// The request was removed by `RequestQueue::clear`
    #[error("request queue cleared")]
    QueueCleared,

    /// The offline queue was full and could not make room
    #[error("offline queue full")]
    OfflineQueueFull,

    /// The dispatch task dropped the outcome channel without delivering
    #[error("outcome channel closed")]
    ChannelClosed,
}

impl DispatchError {
    /// Whether the queue may retry an attempt that failed with this error.
    ///
    /// Transient network failures, timeouts, 429s and 5xx responses are
    /// retryable; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Network(_)
                | DispatchError::Timeout { .. }
                | DispatchError::RateLimited { .. }
                | DispatchError::Server { .. }
        )
    }
}
