//! Request and response model shared by the queue and its transports

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Header the server uses to delay a 429'd client, in seconds
pub const HEADER_RETRY_AFTER: &str = "retry-after";
/// Header carrying the remaining request quota
pub const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the seconds until the quota window resets
pub const HEADER_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// A unique identifier attached to each enqueued request, used to correlate
/// log lines across retries.
pub type RequestId = String;

/// Generates a new, unique request ID using UUIDv4.
pub fn gen_request_id() -> RequestId {
    Uuid::new_v4().to_string()
}

/// HTTP methods the upstream API is called with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        };
        write!(f, "{s}")
    }
}

/// Importance tier used to order contention for dispatch slots.
///
/// The derived ordering sorts `High` first, so a plain sort by priority
/// yields dispatch order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// An outbound request as described by a caller.
///
/// The body is treated opaquely; this subsystem never interprets payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Adds a header, replacing any previous value for the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets a JSON body.
    pub fn json_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response from the upstream API: status, headers and the raw body.
///
/// Header names are stored lowercased so lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl ApiResponse {
    /// 2xx and 3xx count as success; redirects are the HTTP client's problem.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The server's `Retry-After` delay, if present and parseable.
    ///
    /// Parsed leniently as fractional seconds; the HTTP-date form is not
    /// supported by the upstream API.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header_seconds(HEADER_RETRY_AFTER)
    }

    /// Remaining request quota reported by the server, if present.
    pub fn rate_limit_remaining(&self) -> Option<f64> {
        self.header(HEADER_RATE_LIMIT_REMAINING)?.trim().parse().ok()
    }

    /// Time until the server's quota window resets, if present.
    pub fn rate_limit_reset(&self) -> Option<Duration> {
        self.header_seconds(HEADER_RATE_LIMIT_RESET)
    }

    fn header_seconds(&self, name: &str) -> Option<Duration> {
        let secs: f64 = self.header(name)?.trim().parse().ok()?;
        if secs.is_finite() && secs >= 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        }
    }
}

/// Per-enqueue options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Priority,
    /// Overrides the queue's `default_timeout` for this request
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn high() -> Self {
        Self {
            priority: Priority::High,
            ..Self::default()
        }
    }

    pub fn low() -> Self {
        Self {
            priority: Priority::Low,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
