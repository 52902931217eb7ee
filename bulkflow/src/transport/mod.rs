//! Request/response transport and outcome classification.
//!
//! A [`Transport`] sends one request and classifies what came back. It never
//! retries and never looks inside a payload; retries live in [`retry`] and
//! payload semantics in the stages.

#[cfg(feature = "http")]
pub mod http;
pub mod retry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "http")]
pub use http::{Credentials, HttpTransport};
pub use retry::{with_retry, RetryError, RetryPolicy};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
}

impl Method {
    /// Returns the method name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Extra headers, in order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Per-call timeout. The transport's default applies when unset.
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    /// Creates a request with no body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// A GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// A POST request with a JSON body.
    #[must_use]
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self::new(Method::Post, url).with_json(body)
    }

    /// A PATCH request with a JSON body.
    #[must_use]
    pub fn patch_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self::new(Method::Patch, url).with_json(body)
    }

    /// A PUT request carrying raw bytes.
    #[must_use]
    pub fn put(url: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        Self::new(Method::Put, url)
            .with_header("Content-Type", content_type)
            .with_body(body)
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn with_json(self, body: &serde_json::Value) -> Self {
        self.with_header("Content-Type", "application/json; charset=utf-8")
            .with_body(body.to_string().into_bytes())
    }

    /// Looks up a header case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Coarse outcome class of a status code or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    /// 2xx.
    Ok,
    /// Worth retrying.
    Transient,
    /// Not worth retrying.
    Fatal,
}

impl StatusCategory {
    /// Classifies an HTTP status code. 5xx is transient, everything else non-2xx is fatal.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Ok,
            500..=599 => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

/// A response with a 2xx status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// The body as UTF-8 text.
    pub fn text(&self) -> Result<&str, TransportError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| TransportError::malformed(format!("response body is not UTF-8: {e}")))
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::malformed(format!("invalid JSON response: {e}")))
    }

    /// Turns a non-2xx response into the matching error.
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if StatusCategory::from_status(self.status) == StatusCategory::Ok {
            Ok(self)
        } else {
            Err(TransportError::from_status(self.status, self.body))
        }
    }
}

/// Fine-grained failure kind. Retry policies select on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection could not be established or was dropped.
    Connect,
    /// The per-call timeout elapsed.
    Timeout,
    /// 5xx response.
    Server,
    /// 4xx response.
    Client,
    /// The response could not be understood.
    Malformed,
    /// Anything else, such as an unbuildable request.
    Other,
}

impl TransportErrorKind {
    /// The coarse category of this kind.
    #[must_use]
    pub const fn category(&self) -> StatusCategory {
        match self {
            Self::Connect | Self::Timeout | Self::Server => StatusCategory::Transient,
            Self::Client | Self::Malformed | Self::Other => StatusCategory::Fatal,
        }
    }

    /// Returns the kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Client => "client",
            Self::Malformed => "malformed",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error{}: {message}", status_suffix(.status.as_ref()))]
pub struct TransportError {
    /// What went wrong.
    pub kind: TransportErrorKind,
    /// Status code, for HTTP-level failures.
    pub status: Option<u16>,
    /// Human-readable description.
    pub message: String,
    /// Response body, if one came back.
    pub body: Option<String>,
}

impl TransportError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            body: None,
        }
    }

    /// Builds the error for a non-2xx status.
    #[must_use]
    pub fn from_status(status: u16, body: impl AsRef<[u8]>) -> Self {
        let kind = if StatusCategory::from_status(status) == StatusCategory::Transient {
            TransportErrorKind::Server
        } else {
            TransportErrorKind::Client
        };
        let body = String::from_utf8_lossy(body.as_ref()).into_owned();
        Self {
            kind,
            status: Some(status),
            message: format!("remote service returned status {status}"),
            body: (!body.is_empty()).then_some(body),
        }
    }

    /// Connection failure.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    /// Per-call timeout elapsed.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Unparseable response.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Malformed, message)
    }

    /// Any other failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// The coarse category of this error.
    #[must_use]
    pub const fn category(&self) -> StatusCategory {
        self.kind.category()
    }

    /// Whether the error is in the transient category.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind.category(), StatusCategory::Transient)
    }
}

fn status_suffix(status: Option<&u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

/// Sends requests to the bulk service.
///
/// Implementations return `Err` for every non-2xx status, classified via
/// [`TransportError::from_status`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
