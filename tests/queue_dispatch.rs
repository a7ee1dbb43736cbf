//! End-to-end dispatch scenarios against scripted fake transports

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::sleep;
use tower::service_fn;

use sync_dispatch::{
    ApiRequest, ApiResponse, CircuitBreakerConfig, DispatchError, Priority, RequestOptions,
    RequestQueue,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn response(status: u16) -> ApiResponse {
    ApiResponse {
        status,
        headers: HashMap::new(),
        body: Bytes::from_static(b"{}"),
    }
}

fn response_with_headers(status: u16, headers: &[(&str, &str)]) -> ApiResponse {
    ApiResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: Bytes::from_static(b"{}"),
    }
}

fn fast_breaker(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout: Duration::from_secs(60),
        success_threshold: 1,
        failure_window: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn two_failures_then_success_resolves_within_retry_budget() {
    init_tracing();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(DispatchError::Network("connection reset".into()))
            } else {
                Ok(response(200))
            }
        }
    });

    let queue = RequestQueue::builder(transport)
        .max_retries(2)
        .backoff(Duration::from_millis(1), Duration::from_millis(4))
        .build();

    let resp = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/saved"),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persistent_failure_exhausts_retries_after_max_plus_one_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<ApiResponse, _>(DispatchError::Server { status: 502 }) }
    });

    let queue = RequestQueue::builder(transport)
        .max_retries(2)
        .backoff(Duration::from_millis(1), Duration::from_millis(4))
        .build();

    let err = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/saved"),
            RequestOptions::default(),
        )
        .await
        .unwrap_err();

    // max_retries counts additional attempts: 1 initial + 2 retries
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match err {
        DispatchError::RetriesExhausted { attempts: n, last } => {
            assert_eq!(n, 3);
            assert!(matches!(*last, DispatchError::Server { status: 502 }));
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn client_errors_are_terminal_without_retry() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, DispatchError>(response(404)) }
    });

    let queue = RequestQueue::builder(transport).max_retries(3).build();

    let err = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/saved/missing"),
            RequestOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Client { status: 404 }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limited_response_waits_for_retry_after() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Ok::<_, DispatchError>(response_with_headers(429, &[("retry-after", "0.05")]))
            } else {
                Ok(response(200))
            }
        }
    });

    let queue = RequestQueue::builder(transport)
        .max_retries(2)
        .backoff(Duration::from_millis(1), Duration::from_millis(2))
        .build();

    let started = Instant::now();
    let resp = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/saved"),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    // The server's retry-after (50ms) overrides the 1ms computed backoff.
    assert!(started.elapsed() >= Duration::from_millis(45));
}

#[tokio::test]
async fn open_circuit_fails_fast_without_network_call() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<ApiResponse, _>(DispatchError::Network("refused".into())) }
    });

    let queue = RequestQueue::builder(transport)
        .max_retries(0)
        .circuit_breaker(fast_breaker(1))
        .build();

    // First request fails terminally and trips the breaker.
    let _ = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/a"),
            RequestOptions::default(),
        )
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let err = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/b"),
            RequestOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        DispatchError::CircuitOpen { retry_in } => assert!(retry_in > Duration::ZERO),
        other => panic!("expected circuit-open, got {other:?}"),
    }
    // No network attempt was consumed by the refused request.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reset_circuit_breaker_reopens_dispatch() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err(DispatchError::Network("refused".into()))
            } else {
                Ok(response(200))
            }
        }
    });

    let queue = RequestQueue::builder(transport)
        .max_retries(0)
        .circuit_breaker(fast_breaker(1))
        .build();

    let _ = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/a"),
            RequestOptions::default(),
        )
        .await;
    assert!(matches!(
        queue
            .enqueue(
                ApiRequest::get("https://api.example.com/b"),
                RequestOptions::default()
            )
            .await
            .unwrap_err(),
        DispatchError::CircuitOpen { .. }
    ));

    queue.reset_circuit_breaker();
    let resp = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/c"),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn pause_blocks_dispatch_until_resume() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, DispatchError>(response(200)) }
    });

    let queue = RequestQueue::builder(transport).build();
    queue.pause();

    let pending = queue.enqueue(
        ApiRequest::get("https://api.example.com/saved"),
        RequestOptions::default(),
    );
    sleep(Duration::from_millis(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert!(queue.status().is_paused);

    queue.resume();
    let resp = pending.await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn waiting_requests_dispatch_by_priority_without_preemption() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let transport = service_fn(move |req: ApiRequest| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(req.url.clone());
            sleep(Duration::from_millis(20)).await;
            Ok::<_, DispatchError>(response(200))
        }
    });

    let queue = RequestQueue::builder(transport).max_concurrent(1).build();

    let low = queue.enqueue(ApiRequest::get("/low"), RequestOptions::low());
    // Let the low-priority request claim the only slot first.
    sleep(Duration::from_millis(5)).await;
    let normal = queue.enqueue(ApiRequest::get("/normal"), RequestOptions::default());
    let high = queue.enqueue(ApiRequest::get("/high"), RequestOptions::high());

    let (low, normal, high) = futures::future::join3(low, normal, high).await;
    low.unwrap();
    normal.unwrap();
    high.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["/low", "/high", "/normal"]);
}

#[tokio::test]
async fn offline_enqueue_parks_then_online_dispatches() {
    init_tracing();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let transport = service_fn(move |_req: ApiRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, DispatchError>(response(200)) }
    });

    let queue = RequestQueue::builder(transport).build();
    queue.set_online(false);

    let parked = queue.enqueue(
        ApiRequest::get("https://api.example.com/saved"),
        RequestOptions::default(),
    );
    sleep(Duration::from_millis(20)).await;

    let status = queue.status();
    assert!(!status.is_online);
    assert_eq!(status.offline_queue_size, 1);
    assert_eq!(status.queue_length, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 0);

    queue.set_online(true);
    let resp = parked.await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn offline_drain_preserves_priority_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let transport = service_fn(move |req: ApiRequest| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(req.url.clone());
            sleep(Duration::from_millis(10)).await;
            Ok::<_, DispatchError>(response(200))
        }
    });

    let queue = RequestQueue::builder(transport).max_concurrent(1).build();
    queue.set_online(false);

    let low = queue.enqueue(ApiRequest::get("/low"), RequestOptions::low());
    let high = queue.enqueue(ApiRequest::get("/high"), RequestOptions::high());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.status().offline_queue_size, 2);

    queue.set_online(true);
    let (low, high) = futures::future::join(low, high).await;
    low.unwrap();
    high.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["/high", "/low"]);
}

#[tokio::test]
async fn full_offline_queue_rejects_with_backpressure() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        Ok::<_, DispatchError>(response(200))
    });

    let queue = RequestQueue::builder(transport).offline_queue_size(1).build();
    queue.set_online(false);

    let first = queue.enqueue(ApiRequest::get("/one"), RequestOptions::default());
    sleep(Duration::from_millis(10)).await;
    let second = queue.enqueue(ApiRequest::get("/two"), RequestOptions::default());

    assert!(matches!(
        second.await.unwrap_err(),
        DispatchError::OfflineQueueFull
    ));
    assert_eq!(queue.status().offline_queue_size, 1);

    queue.set_online(true);
    assert_eq!(first.await.unwrap().status, 200);
}

#[tokio::test]
async fn full_offline_queue_evicts_low_priority_work() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        Ok::<_, DispatchError>(response(200))
    });

    let queue = RequestQueue::builder(transport).offline_queue_size(1).build();
    queue.set_online(false);

    let low = queue.enqueue(ApiRequest::get("/low"), RequestOptions::low());
    sleep(Duration::from_millis(10)).await;
    let high = queue.enqueue(ApiRequest::get("/high"), RequestOptions::high());

    assert!(matches!(
        low.await.unwrap_err(),
        DispatchError::OfflineQueueFull
    ));

    queue.set_online(true);
    assert_eq!(high.await.unwrap().status, 200);
}

#[tokio::test]
async fn clear_fails_pending_requests_with_distinct_error() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        Ok::<_, DispatchError>(response(200))
    });

    let queue = RequestQueue::builder(transport).build();
    queue.pause();

    let pending = queue.enqueue(
        ApiRequest::get("https://api.example.com/saved"),
        RequestOptions::default(),
    );
    queue.clear();

    assert!(matches!(
        pending.await.unwrap_err(),
        DispatchError::QueueCleared
    ));
    assert_eq!(queue.status().queue_length, 0);
}

#[tokio::test]
async fn concurrency_stays_within_bound() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current2, peak2) = (current.clone(), peak.clone());
    let transport = service_fn(move |_req: ApiRequest| {
        let (current, peak) = (current2.clone(), peak2.clone());
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, DispatchError>(response(200))
        }
    });

    let queue = RequestQueue::builder(transport).max_concurrent(2).build();

    let requests: Vec<_> = (0..6)
        .map(|i| queue.enqueue(ApiRequest::get(format!("/item/{i}")), RequestOptions::default()))
        .collect();
    for outcome in futures::future::join_all(requests).await {
        outcome.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn local_rate_limit_throttles_dispatch() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        Ok::<_, DispatchError>(response(200))
    });

    // 2 tokens per 200ms: the third request must wait ~100ms for a token.
    let queue = RequestQueue::builder(transport)
        .max_concurrent(1)
        .rate_limit(2, Duration::from_millis(200))
        .build();

    let started = Instant::now();
    let requests: Vec<_> = (0..3)
        .map(|i| queue.enqueue(ApiRequest::get(format!("/item/{i}")), RequestOptions::default()))
        .collect();
    for outcome in futures::future::join_all(requests).await {
        outcome.unwrap();
    }

    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn server_quota_headers_reconcile_the_limiter() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        Ok::<_, DispatchError>(response_with_headers(
            200,
            &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "30")],
        ))
    });

    let queue = RequestQueue::builder(transport)
        .rate_limit(60, Duration::from_secs(60))
        .build();

    queue
        .enqueue(
            ApiRequest::get("https://api.example.com/saved"),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    // Server said the shared quota is spent; local accounting must agree.
    assert!(queue.status().available_tokens < 1.0);
}

#[tokio::test]
async fn per_request_timeout_overrides_default() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        sleep(Duration::from_millis(100)).await;
        Ok::<_, DispatchError>(response(200))
    });

    let queue = RequestQueue::builder(transport).max_retries(0).build();

    let err = queue
        .enqueue(
            ApiRequest::get("https://api.example.com/slow"),
            RequestOptions::default().with_timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();

    match err {
        DispatchError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, DispatchError::Timeout { .. }));
        }
        other => panic!("expected exhausted timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn status_reports_a_fresh_queue() {
    let transport = service_fn(move |_req: ApiRequest| async move {
        Ok::<_, DispatchError>(response(200))
    });
    let queue = RequestQueue::builder(transport)
        .rate_limit(60, Duration::from_secs(60))
        .build();

    let status = queue.status();
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.active_requests, 0);
    assert!(status.is_online);
    assert!(!status.is_paused);
    assert_eq!(status.offline_queue_size, 0);
    assert!(status.available_tokens > 59.0);
    assert_eq!(
        serde_json::to_value(status.circuit_state).unwrap(),
        serde_json::json!("closed")
    );
}

#[tokio::test]
async fn equal_priority_requests_dispatch_fifo() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let transport = service_fn(move |req: ApiRequest| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(req.url.clone());
            Ok::<_, DispatchError>(response(200))
        }
    });

    let queue = RequestQueue::builder(transport).max_concurrent(1).build();
    queue.pause();
    let requests: Vec<_> = (0..4)
        .map(|i| {
            queue.enqueue(
                ApiRequest::get(format!("/item/{i}")),
                RequestOptions::default().with_priority(Priority::Normal),
            )
        })
        .collect();
    queue.resume();

    for outcome in futures::future::join_all(requests).await {
        outcome.unwrap();
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec!["/item/0", "/item/1", "/item/2", "/item/3"]
    );
}
