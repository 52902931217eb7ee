//! `reqwest`-backed [`Transport`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;

use super::{Method, StatusCategory, Transport, TransportError, TransportRequest, TransportResponse};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Caller-acquired credentials, attached to every request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token_type: String,
    access_token: String,
}

impl Credentials {
    /// Creates credentials from an OAuth-style token pair.
    #[must_use]
    pub fn new(token_type: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            token_type: token_type.into(),
            access_token: access_token.into(),
        }
    }

    /// Bearer token credentials.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self::new("Bearer", access_token)
    }

    /// The `Authorization` header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// HTTP transport over one shared connection pool.
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Credentials,
    default_timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport with a fresh client.
    pub fn new(credentials: Credentials) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, credentials))
    }

    /// Creates a transport on an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Sets the timeout used when a request carries none.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(err.to_string())
    } else if err.is_builder() {
        TransportError::other(err.to_string())
    } else if err.is_decode() {
        TransportError::malformed(err.to_string())
    } else {
        TransportError::connect(err.to_string())
    }
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut out: String = text.chars().take(MAX_LOG_BODY_CHARS).collect();
    if text.chars().count() > MAX_LOG_BODY_CHARS {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self
            .client
            .request(Self::method(method), &url)
            .header(AUTHORIZATION, self.credentials.header_value())
            .timeout(timeout.unwrap_or(self.default_timeout));
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| classify(&e))?;

        if StatusCategory::from_status(status) == StatusCategory::Ok {
            tracing::debug!(%method, url = %url, status, "Bulk API response");
        } else {
            tracing::debug!(%method, url = %url, status, body = %preview(&bytes), "Bulk API error response");
        }

        TransportResponse::new(status, bytes.to_vec()).error_for_status()
    }
}
