//! # HTTP Transport
//!
//! The seam between the CRM client and the network.
//!
//! ## Layering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Outbound Request Path                           │
//! │                                                                         │
//! │  CrmClient (pacing, retry, pagination)                                 │
//! │       │                                                                 │
//! │       │  HttpRequest { url, query, bearer_token }                      │
//! │       ▼                                                                 │
//! │  dyn HttpTransport                                                     │
//! │       │                                                                 │
//! │       ├── ReqwestTransport  ← production (reqwest)                     │
//! │       └── FakeCrm           ← in-memory CRM for tests and demos        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  HttpResponse { status, body }                                         │
//! │                                                                         │
//! │  The transport never interprets status codes: a 429 or 500 is a        │
//! │  successful *transport* call. Only failures to get any response at     │
//! │  all surface as TransportError.                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Request / Response
// =============================================================================

/// An authenticated GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Absolute URL without query string.
    pub url: String,

    /// Query parameters in order.
    pub query: Vec<(String, String)>,

    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: String,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        HttpRequest {
            url: url.into(),
            query: Vec::new(),
            bearer_token: bearer_token.into(),
        }
    }

    /// Appends a query parameter (builder style).
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Returns the first value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response: status code and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        HttpResponse {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request produced no HTTP response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Issues authenticated GET requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the reqwest transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Whole-request timeout.
    pub request_timeout: Duration,

    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,

    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("funnel-sync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// =============================================================================
// Reqwest Transport
// =============================================================================

/// Production transport backed by a shared `reqwest::Client`.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(ReqwestTransport {
            client,
            timeout_secs: config.request_timeout.as_secs(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!(url = %request.url, params = request.query.len(), "GET");

        let response = self
            .client
            .get(&request.url)
            .query(&request.query)
            .bearer_auth(&request.bearer_token)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(HttpResponse { status, body })
    }
}

impl ReqwestTransport {
    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout_secs)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::get("https://acme.kommo.com/api/v4/leads", "tok")
            .param("page", 2)
            .param("limit", 250);

        assert_eq!(req.query_value("page"), Some("2"));
        assert_eq!(req.query_value("limit"), Some("250"));
        assert_eq!(req.query_value("missing"), None);
    }

    #[test]
    fn test_response_success_range() {
        assert!(HttpResponse::new(200, "").is_success());
        assert!(HttpResponse::new(204, "").is_success());
        assert!(!HttpResponse::new(429, "").is_success());
        assert!(!HttpResponse::new(500, "").is_success());
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("funnel-sync/"));
        assert!(ReqwestTransport::new(config).is_ok());
    }
}
