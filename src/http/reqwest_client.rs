//! Production HTTP client using reqwest.

use std::time::Duration;

use async_trait::async_trait;

use super::{HttpClient, HttpRequest, HttpResponse, TransportError};

#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Wrap a preconfigured client (proxies, custom roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: reqwest::Error, timeout_ms: u64) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout { timeout_ms }
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(
        &self,
        request: &HttpRequest,
        timeout_ms: u64,
    ) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            tracing::error!(method = %request.method, error = %e, "Invalid HTTP method");
            TransportError::InvalidRequest(format!(
                "invalid HTTP method '{}': {}",
                request.method, e
            ))
        })?;

        tracing::debug!(timeout_ms, "Executing HTTP request");

        let mut req = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(timeout_ms));

        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            req = req
                .header("Content-Type", "application/json")
                .body(body.clone());
            tracing::trace!(body_len = body.len(), "Added request body");
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, "HTTP request failed");
            classify(e, timeout_ms)
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, timeout_ms))?;

        tracing::info!(status, response_len = body.len(), "HTTP request completed");

        Ok(HttpResponse { status, body })
    }
}
