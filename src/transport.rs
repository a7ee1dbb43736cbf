//! Transport seam between the queue and the network
//!
//! The queue is generic over any `tower::Service<ApiRequest>`, which is how
//! tests script fake upstreams with `tower::service_fn`. [`HttpTransport`]
//! is the production implementation over a shared `reqwest::Client`.
//!
//! Transports never retry; all retry and backoff logic lives in the queue.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::Service;

use crate::error::DispatchError;
use crate::request::{ApiRequest, ApiResponse, HttpMethod};

/// Production transport backed by `reqwest`.
///
/// `reqwest::Client` is an `Arc` internally, so cloning the transport for
/// each dispatch attempt reuses the same connection pool.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing client (custom TLS, proxy, user-agent, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

impl Service<ApiRequest> for HttpTransport {
    type Response = ApiResponse;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<ApiResponse, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client.request(to_reqwest_method(req.method), req.url.as_str());
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &req.body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| DispatchError::Network(e.to_string()))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| DispatchError::Network(e.to_string()))?;

            Ok(ApiResponse {
                status,
                headers,
                body,
            })
        })
    }
}
