//! HTTP client abstraction for the remote channel.
//!
//! This module defines the `HttpClient` trait to abstract request execution,
//! enabling testability with mock implementations.

mod mock;
mod reqwest_client;

pub use mock::{MockCall, MockHttpClient};
pub use reqwest_client::ReqwestHttpClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::FailureReason;

/// An outbound request, fully assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (e.g., "POST", "GET")
    pub method: String,
    /// Absolute URL
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// JSON body, sent with `Content-Type: application/json`
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: String) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure below the HTTP layer: no status code was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<TransportError> for FailureReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidRequest(error) => FailureReason::RequestBuilderError { error },
            other => FailureReason::NetworkError {
                error: other.to_string(),
            },
        }
    }
}

/// Trait for executing HTTP requests.
///
/// # Example
/// ```ignore
/// let client = ReqwestHttpClient::new();
/// let response = client.execute(&HttpRequest::get(url), 5000).await?;
/// println!("Status: {}, Body: {}", response.status, response.body);
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute a request with an explicit timeout.
    ///
    /// Any status code counts as a response; only failures to obtain one are errors.
    async fn execute(
        &self,
        request: &HttpRequest,
        timeout_ms: u64,
    ) -> Result<HttpResponse, TransportError>;
}
