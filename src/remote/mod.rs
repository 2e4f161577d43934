//! Outbound operations against the workflow service and its alternates.
//!
//! A [`RemoteChannel`] performs exactly one attempt per call and reports a
//! classified [`FailureReason`]; retrying is layered on top with
//! [`RetryPolicy`] so every retry can be surfaced as a progress event.

mod retry;

pub use retry::{RetryNotice, RetryPolicy};

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{EndpointConfig, ReconcilerConfig};
use crate::envelope::EncryptedEnvelope;
use crate::error::FailureReason;
use crate::fallback::DataSource;
use crate::http::{HttpClient, HttpRequest};
use crate::product::ExportBatch;
use crate::session::SessionContext;

/// Longest response body excerpt carried in a failure reason.
const BODY_EXCERPT_CHARS: usize = 512;

/// Positive acknowledgement of a product submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
    pub body: String,
}

/// Submits products and fetches encrypted rates.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// POST the batch. Only 200 and 201 count as acknowledgement.
    async fn submit_products(
        &self,
        batch: &ExportBatch,
        session: &SessionContext,
    ) -> Result<Ack, FailureReason>;

    /// Retrieve an envelope from `source`.
    async fn fetch_encrypted_rates(
        &self,
        source: DataSource,
        session: &SessionContext,
    ) -> Result<EncryptedEnvelope, FailureReason>;
}

/// [`RemoteChannel`] over an [`HttpClient`], with the demo dataset read from disk.
#[derive(Clone)]
pub struct HttpRemoteChannel<H: HttpClient> {
    http: H,
    endpoints: EndpointConfig,
    fetch_timeout_ms: u64,
    submit_timeout_ms: u64,
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}

impl<H: HttpClient> HttpRemoteChannel<H> {
    pub fn new(http: H, endpoints: EndpointConfig) -> Self {
        let defaults = ReconcilerConfig::default();
        Self {
            http,
            endpoints,
            fetch_timeout_ms: defaults.fetch_timeout_ms,
            submit_timeout_ms: defaults.submit_timeout_ms,
        }
    }

    pub fn from_config(http: H, config: &ReconcilerConfig) -> Self {
        Self::new(http, config.endpoints.clone())
            .with_timeouts(config.fetch_timeout_ms, config.submit_timeout_ms)
    }

    pub fn with_timeouts(mut self, fetch_timeout_ms: u64, submit_timeout_ms: u64) -> Self {
        self.fetch_timeout_ms = fetch_timeout_ms;
        self.submit_timeout_ms = submit_timeout_ms;
        self
    }

    async fn fetch_over_http(
        &self,
        url: &str,
        session: &SessionContext,
    ) -> Result<EncryptedEnvelope, FailureReason> {
        let request = HttpRequest::get(url).with_headers(session.identity_headers(Utc::now()));
        let response = self.http.execute(&request, self.fetch_timeout_ms).await?;

        if !response.is_success() {
            return Err(FailureReason::from_status(
                response.status,
                excerpt(&response.body),
            ));
        }
        EncryptedEnvelope::parse(&response.body)
            .map_err(|error| FailureReason::MalformedResponse { error })
    }

    async fn load_demo_dataset(&self) -> Result<EncryptedEnvelope, FailureReason> {
        let path = self.endpoints.demo_envelope_path.as_ref().ok_or(
            FailureReason::SourceNotConfigured {
                source: DataSource::LocalDemo,
            },
        )?;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            FailureReason::MalformedResponse {
                error: format!("demo dataset {} unreadable: {}", path.display(), e),
            }
        })?;
        EncryptedEnvelope::parse(&text).map_err(|error| FailureReason::MalformedResponse { error })
    }
}

#[async_trait]
impl<H: HttpClient> RemoteChannel for HttpRemoteChannel<H> {
    #[tracing::instrument(skip_all, fields(products = batch.count(), license = %session.masked_license()))]
    async fn submit_products(
        &self,
        batch: &ExportBatch,
        session: &SessionContext,
    ) -> Result<Ack, FailureReason> {
        let body = batch
            .to_payload()
            .map_err(|e| FailureReason::RequestBuilderError {
                error: e.to_string(),
            })?;
        let request = HttpRequest::post_json(&self.endpoints.submit_products_url, body)
            .with_headers(session.identity_headers(Utc::now()));

        let response = self.http.execute(&request, self.submit_timeout_ms).await?;
        match response.status {
            200 | 201 => {
                tracing::info!(status = response.status, "Products acknowledged");
                Ok(Ack {
                    status: response.status,
                    body: response.body,
                })
            }
            status => {
                tracing::warn!(status, "Product submission rejected");
                Err(FailureReason::from_status(status, excerpt(&response.body)))
            }
        }
    }

    #[tracing::instrument(skip(self, session), fields(license = %session.masked_license()))]
    async fn fetch_encrypted_rates(
        &self,
        source: DataSource,
        session: &SessionContext,
    ) -> Result<EncryptedEnvelope, FailureReason> {
        let envelope = match source {
            DataSource::Primary => {
                self.fetch_over_http(&self.endpoints.primary_rates_url, session)
                    .await
            }
            DataSource::Alternate => match &self.endpoints.alternate_rates_url {
                Some(url) => self.fetch_over_http(url, session).await,
                None => Err(FailureReason::SourceNotConfigured { source }),
            },
            DataSource::LocalDemo => self.load_demo_dataset().await,
        }?;

        tracing::debug!(items = envelope.items().len(), "Envelope received");
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::seal;
    use crate::http::{HttpResponse, MockHttpClient, TransportError};
    use crate::product::Product;
    use crate::session::{HEADER_LICENSE_EMAIL, HEADER_LICENSE_NUMBER};
    use secrecy::SecretString;

    const SUBMIT: &str = "https://wf.example.com/products";
    const PRIMARY: &str = "https://wf.example.com/rates";
    const ALTERNATE: &str = "https://alt.example.com/rates";

    fn session() -> SessionContext {
        SessionContext::new("LIC-42", "ops@example.com").with_secret(SecretString::from("k"))
    }

    fn endpoints() -> EndpointConfig {
        EndpointConfig {
            submit_products_url: SUBMIT.to_string(),
            primary_rates_url: PRIMARY.to_string(),
            alternate_rates_url: None,
            demo_envelope_path: None,
        }
    }

    fn batch() -> ExportBatch {
        ExportBatch::new(
            vec![Product {
                sku: "A-1".into(),
                ean: Some("4006381333931".into()),
                taric: "8471300000".into(),
                name: Some("Laptop".into()),
                quantity: Some(3),
                unit_price_cents: Some(89900),
            }],
            Utc::now(),
        )
        .unwrap()
    }

    fn ok(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }

    #[tokio::test]
    async fn test_submit_sends_payload_and_identity_headers() {
        let http = MockHttpClient::new();
        http.add_response(&format!("POST {}", SUBMIT), ok(201, "queued"));
        let channel = HttpRemoteChannel::new(http.clone(), endpoints()).with_timeouts(1000, 2000);

        let ack = channel.submit_products(&batch(), &session()).await.unwrap();
        assert_eq!(ack.status, 201);

        let calls = http.get_calls();
        let call = &calls[0];
        assert_eq!(call.timeout_ms, 2000);
        assert_eq!(call.header(HEADER_LICENSE_NUMBER), Some("LIC-42"));
        assert_eq!(call.header(HEADER_LICENSE_EMAIL), Some("ops@example.com"));
        let body: serde_json::Value = serde_json::from_str(call.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["products"][0]["ean"], "4006381333931");
    }

    #[tokio::test]
    async fn test_submit_classifies_rejections() {
        let http = MockHttpClient::new();
        let key = format!("POST {}", SUBMIT);
        http.add_response(&key, ok(202, "accepted later"));
        http.add_response(&key, ok(403, "license expired"));
        http.add_response(&key, Err(TransportError::Connect("refused".into())));
        let channel = HttpRemoteChannel::new(http, endpoints());

        let r1 = channel.submit_products(&batch(), &session()).await.unwrap_err();
        assert!(matches!(r1, FailureReason::NonRetriableHttpStatus { status: 202, .. }));
        let r2 = channel.submit_products(&batch(), &session()).await.unwrap_err();
        assert!(matches!(r2, FailureReason::AuthorizationRejected { status: 403, .. }));
        let r3 = channel.submit_products(&batch(), &session()).await.unwrap_err();
        assert!(r3.is_retriable());
    }

    #[tokio::test]
    async fn test_fetch_primary_parses_envelope() {
        let s = session();
        let item = seal("SELECT 1;", &s, [9u8; 16]).unwrap();
        let body = serde_json::json!([{ "json": item }]).to_string();

        let http = MockHttpClient::new();
        http.add_response(&format!("GET {}", PRIMARY), ok(200, &body));
        let channel = HttpRemoteChannel::new(http.clone(), endpoints()).with_timeouts(1500, 1);

        let envelope = channel
            .fetch_encrypted_rates(DataSource::Primary, &s)
            .await
            .unwrap();
        assert_eq!(envelope.items(), &[item]);
        assert_eq!(http.get_calls()[0].timeout_ms, 1500);
        assert!(http.get_calls()[0].body.is_none());
    }

    #[tokio::test]
    async fn test_fetch_failures() {
        let http = MockHttpClient::new();
        let key = format!("GET {}", PRIMARY);
        http.add_response(&key, ok(200, r#"{"message":"Workflow was started"}"#));
        http.add_response(&key, ok(502, "bad gateway"));
        http.add_response(&key, Err(TransportError::Timeout { timeout_ms: 30000 }));
        let channel = HttpRemoteChannel::new(http, endpoints());
        let s = session();

        let malformed = channel
            .fetch_encrypted_rates(DataSource::Primary, &s)
            .await
            .unwrap_err();
        assert!(matches!(malformed, FailureReason::MalformedResponse { .. }));
        assert!(
            channel
                .fetch_encrypted_rates(DataSource::Primary, &s)
                .await
                .unwrap_err()
                .is_retriable()
        );
        assert!(
            channel
                .fetch_encrypted_rates(DataSource::Primary, &s)
                .await
                .unwrap_err()
                .is_retriable()
        );
    }

    #[tokio::test]
    async fn test_fetch_alternate_and_demo_sources() {
        let s = session();
        let dir = tempfile::tempdir().unwrap();
        let demo_path = dir.path().join("demo.json");
        let demo = EncryptedEnvelope::from_items(vec![seal("SELECT 2;", &s, [1u8; 16]).unwrap()])
            .unwrap();
        std::fs::write(&demo_path, demo.to_json().unwrap()).unwrap();

        // Neither configured yet
        let bare = HttpRemoteChannel::new(MockHttpClient::new(), endpoints());
        assert_eq!(
            bare.fetch_encrypted_rates(DataSource::Alternate, &s)
                .await
                .unwrap_err(),
            FailureReason::SourceNotConfigured {
                source: DataSource::Alternate
            }
        );
        assert_eq!(
            bare.fetch_encrypted_rates(DataSource::LocalDemo, &s)
                .await
                .unwrap_err(),
            FailureReason::SourceNotConfigured {
                source: DataSource::LocalDemo
            }
        );

        let http = MockHttpClient::new();
        let alt_item = seal("SELECT 3;", &s, [2u8; 16]).unwrap();
        http.add_response(
            &format!("GET {}", ALTERNATE),
            ok(200, &serde_json::to_string(&alt_item).unwrap()),
        );
        let channel = HttpRemoteChannel::new(
            http,
            EndpointConfig {
                alternate_rates_url: Some(ALTERNATE.to_string()),
                demo_envelope_path: Some(demo_path),
                ..endpoints()
            },
        );

        let alt = channel
            .fetch_encrypted_rates(DataSource::Alternate, &s)
            .await
            .unwrap();
        assert_eq!(alt.items(), &[alt_item]);
        let local = channel
            .fetch_encrypted_rates(DataSource::LocalDemo, &s)
            .await
            .unwrap();
        assert_eq!(local, demo);
    }
}
