//! Priority-aware request orchestrator
//!
//! [`RequestQueue`] accepts requests from callers, holds them in per-tier
//! FIFO lanes, and dispatches up to `max_concurrent` of them at a time
//! against the circuit breaker and rate limiter. Failed attempts retry with
//! capped exponential backoff (or the server's retry-after); when offline,
//! dispatch parks requests in the [`OfflineQueue`] until connectivity
//! returns.
//!
//! Callers get a [`ResponseFuture`] per enqueue that settles with the
//! response or one terminal [`DispatchError`]. Enqueuing never blocks.
//!
//! The queue spawns dispatch tasks onto the ambient Tokio runtime, so it
//! must be used from within one.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::QueueConfig;
use crate::error::{DispatchError, Result};
use crate::offline::{AddResult, OfflineQueue};
use crate::rate_limit::RateLimiter;
use crate::request::{gen_request_id, ApiRequest, ApiResponse, Priority, RequestId, RequestOptions};

/// A pending request together with the means to deliver its outcome.
struct QueuedRequest {
    id: RequestId,
    request: ApiRequest,
    priority: Priority,
    timeout: Option<Duration>,
    tx: oneshot::Sender<Result<ApiResponse>>,
}

struct QueueState {
    /// One FIFO lane per priority tier, indexed by `Priority as usize`
    lanes: [VecDeque<QueuedRequest>; 3],
    offline: OfflineQueue<QueuedRequest>,
    active: usize,
    paused: bool,
    online: bool,
}

impl QueueState {
    fn pop_next(&mut self) -> Option<QueuedRequest> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn pending(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Read-only snapshot of the queue, for diagnostics and UI.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub active_requests: usize,
    pub circuit_state: CircuitState,
    pub available_tokens: f64,
    pub is_paused: bool,
    pub is_online: bool,
    pub offline_queue_size: usize,
}

/// Settles with the response or one terminal error per enqueue.
#[must_use = "a response future does nothing unless awaited"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<ApiResponse>>,
}

impl Future for ResponseFuture {
    type Output = Result<ApiResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::ChannelClosed),
        })
    }
}

/// Bounded-concurrency request orchestrator over a single upstream endpoint
/// family sharing one rate limit and one circuit.
///
/// Cloning yields another handle to the same queue.
pub struct RequestQueue<T> {
    transport: T,
    config: Arc<QueueConfig>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    state: Arc<Mutex<QueueState>>,
}

impl<T: Clone> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            breaker: self.breaker.clone(),
            limiter: self.limiter.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> RequestQueue<T>
where
    T: Service<ApiRequest, Response = ApiResponse, Error = DispatchError>
        + Clone
        + Send
        + Sync
        + 'static,
    T::Future: Send,
{
    pub fn new(transport: T, config: QueueConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let offline = OfflineQueue::new(config.offline_queue_size);
        Self {
            transport,
            config: Arc::new(config),
            breaker,
            limiter,
            state: Arc::new(Mutex::new(QueueState {
                lanes: Default::default(),
                offline,
                active: 0,
                paused: false,
                online: true,
            })),
        }
    }

    pub fn builder(transport: T) -> RequestQueueBuilder<T> {
        RequestQueueBuilder {
            transport,
            config: QueueConfig::default(),
        }
    }

    /// Inserts a request into the pending lanes and returns its outcome
    /// future. Never blocks the caller.
    pub fn enqueue(&self, request: ApiRequest, options: RequestOptions) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let queued = QueuedRequest {
            id: gen_request_id(),
            request,
            priority: options.priority,
            timeout: options.timeout,
            tx,
        };
        debug!(
            id = %queued.id,
            method = %queued.request.method,
            url = %queued.request.url,
            priority = %queued.priority,
            "request enqueued"
        );
        {
            let lane = queued.priority as usize;
            let mut state = self.state.lock().unwrap();
            state.lanes[lane].push_back(queued);
        }
        self.pump();
        ResponseFuture { rx }
    }

    /// Stops starting new attempts; in-flight attempts run to completion.
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
        debug!("queue paused");
    }

    /// Restarts dispatch from the head of the pending lanes.
    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        debug!("queue resumed");
        self.pump();
    }

    /// Flips connectivity. Going offline parks pending work in the offline
    /// queue; coming back online drains parked work ahead of newly enqueued
    /// requests, then resumes dispatch.
    pub fn set_online(&self, online: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.online == online {
                return;
            }
            state.online = online;
            if online {
                // Critical section: drained entries go to the front of their
                // lanes, keeping the offline queue's own ordering, before any
                // concurrent enqueue can slip ahead.
                let drained = state.offline.drain();
                if !drained.is_empty() {
                    info!(count = drained.len(), "draining offline queue");
                }
                for entry in drained.into_iter().rev() {
                    let lane = entry.priority as usize;
                    state.lanes[lane].push_front(entry);
                }
            }
        }
        if !online {
            info!("queue offline, parking new dispatches");
        }
        self.pump();
    }

    /// Read-only snapshot of queue, breaker and limiter state.
    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock().unwrap();
        QueueStatus {
            queue_length: state.pending(),
            active_requests: state.active,
            circuit_state: self.breaker.state(),
            available_tokens: self.limiter.available_tokens(),
            is_paused: state.paused,
            is_online: state.online,
            offline_queue_size: state.offline.len(),
        }
    }

    /// Operator override: forces the breaker closed.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Removes every pending request and fails each outcome with
    /// [`DispatchError::QueueCleared`]. In-flight attempts are not aborted.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        let mut cleared = 0usize;
        for lane in &mut state.lanes {
            for entry in lane.drain(..) {
                cleared += 1;
                let _ = entry.tx.send(Err(DispatchError::QueueCleared));
            }
        }
        if cleared > 0 {
            info!(count = cleared, "pending queue cleared");
        }
    }

    /// Starts dispatch tasks while slots and eligible work remain.
    fn pump(&self) {
        loop {
            let entry = {
                let mut state = self.state.lock().unwrap();
                if state.paused {
                    return;
                }
                if !state.online {
                    self.park_pending(&mut state);
                    return;
                }
                if state.active >= self.config.max_concurrent {
                    return;
                }
                match state.pop_next() {
                    Some(entry) => {
                        state.active += 1;
                        entry
                    }
                    None => return,
                }
            };

            let queue = self.clone();
            tokio::spawn(async move {
                queue.dispatch(entry).await;
                queue.state.lock().unwrap().active -= 1;
                queue.pump();
            });
        }
    }

    /// Moves everything pending into the offline queue, applying its
    /// eviction and backpressure rules.
    fn park_pending(&self, state: &mut QueueState) {
        while let Some(entry) = state.pop_next() {
            let priority = entry.priority;
            debug!(id = %entry.id, %priority, "parking request offline");
            match state.offline.add(entry, priority) {
                AddResult::Added => {}
                AddResult::Evicted(old) => {
                    warn!(id = %old.id, "offline queue evicted low-priority request");
                    let _ = old.tx.send(Err(DispatchError::OfflineQueueFull));
                }
                AddResult::Rejected(entry) => {
                    warn!(id = %entry.id, "offline queue full, rejecting request");
                    let _ = entry.tx.send(Err(DispatchError::OfflineQueueFull));
                }
            }
        }
    }

    async fn dispatch(&self, entry: QueuedRequest) {
        let QueuedRequest {
            id,
            request,
            priority: _,
            timeout: per_request,
            tx,
        } = entry;
        let effective_timeout = per_request.unwrap_or(self.config.default_timeout);
        let outcome = self
            .execute_with_retries(&id, request, effective_timeout)
            .await;
        if tx.send(outcome).is_err() {
            debug!(id = %id, "caller dropped before outcome delivery");
        }
    }

    /// One request's full attempt loop: circuit gate, token wait, timed
    /// network call, classification, retry-or-terminal.
    async fn execute_with_retries(
        &self,
        id: &RequestId,
        request: ApiRequest,
        effective_timeout: Duration,
    ) -> Result<ApiResponse> {
        let mut attempt: u32 = 0;
        loop {
            // Circuit gate. Policy: a refusal fails fast, consuming no
            // retries and recording nothing on the breaker.
            if !self.breaker.allow_request() {
                let retry_in = self.breaker.time_until_retry();
                debug!(id = %id, ?retry_in, "circuit open, refusing dispatch");
                return Err(DispatchError::CircuitOpen { retry_in });
            }

            // Token wait. Lacking a token delays the attempt, never fails it.
            while !self.limiter.try_acquire() {
                let wait = self.limiter.wait_time().max(Duration::from_millis(1));
                debug!(id = %id, ?wait, "rate limited locally, waiting for token");
                sleep(wait).await;
            }

            let mut transport = self.transport.clone();
            let call = async {
                ServiceExt::ready(&mut transport)
                    .await?
                    .call(request.clone())
                    .await
            };
            let error = match timeout(effective_timeout, call).await {
                Ok(Ok(response)) => {
                    if let (Some(remaining), Some(reset)) = (
                        response.rate_limit_remaining(),
                        response.rate_limit_reset(),
                    ) {
                        self.limiter.update_from_headers(remaining, reset);
                    }
                    if response.is_success() {
                        self.breaker.record_success();
                        debug!(id = %id, status = response.status, attempt, "request succeeded");
                        return Ok(response);
                    }
                    classify_status(&response)
                }
                Ok(Err(e)) => e,
                Err(_) => DispatchError::Timeout {
                    after: effective_timeout,
                },
            };

            if error.is_retryable() && attempt < self.config.max_retries {
                let delay = match &error {
                    DispatchError::RateLimited {
                        retry_after: Some(delay),
                    } => *delay,
                    _ => self.config.backoff_delay(attempt),
                };
                attempt += 1;
                warn!(
                    id = %id,
                    attempt,
                    max_retries = self.config.max_retries,
                    ?delay,
                    error = %error,
                    "attempt failed, retrying"
                );
                sleep(delay).await;
                continue;
            }

            self.breaker.record_failure();
            let terminal = if error.is_retryable() {
                DispatchError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(error),
                }
            } else {
                error
            };
            warn!(id = %id, error = %terminal, "request failed");
            return Err(terminal);
        }
    }
}

fn classify_status(response: &ApiResponse) -> DispatchError {
    match response.status {
        429 => DispatchError::RateLimited {
            retry_after: response.retry_after(),
        },
        status if status >= 500 => DispatchError::Server { status },
        status => DispatchError::Client { status },
    }
}

/// Fluent construction for [`RequestQueue`]
pub struct RequestQueueBuilder<T> {
    transport: T,
    config: QueueConfig,
}

impl<T> RequestQueueBuilder<T>
where
    T: Service<ApiRequest, Response = ApiResponse, Error = DispatchError>
        + Clone
        + Send
        + Sync
        + 'static,
    T::Future: Send,
{
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn default_timeout(mut self, default_timeout: Duration) -> Self {
        self.config.default_timeout = default_timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.base_backoff = base;
        self.config.max_backoff = max;
        self
    }

    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.config.rate_limit = crate::config::RateLimitConfig {
            max_requests,
            window,
        };
        self
    }

    pub fn circuit_breaker(mut self, config: crate::config::CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    pub fn offline_queue_size(mut self, size: usize) -> Self {
        self.config.offline_queue_size = size;
        self
    }

    pub fn build(self) -> RequestQueue<T> {
        RequestQueue::new(self.transport, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn response(status: u16) -> ApiResponse {
        ApiResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn classify_maps_status_families() {
        assert!(matches!(
            classify_status(&response(429)),
            DispatchError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(&response(500)),
            DispatchError::Server { status: 500 }
        ));
        assert!(matches!(
            classify_status(&response(503)),
            DispatchError::Server { status: 503 }
        ));
        assert!(matches!(
            classify_status(&response(404)),
            DispatchError::Client { status: 404 }
        ));
    }

    #[test]
    fn classify_keeps_retry_after_from_429() {
        let mut resp = response(429);
        resp.headers.insert("retry-after".into(), "3".into());
        match classify_status(&resp) {
            DispatchError::RateLimited {
                retry_after: Some(delay),
            } => assert_eq!(delay, Duration::from_secs(3)),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
