//! Mock HTTP client for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{HttpClient, HttpRequest, HttpResponse, TransportError};

type MockResult = Result<HttpResponse, TransportError>;

/// Mock HTTP client returning canned responses.
///
/// Responses are keyed by `"{METHOD} {url}"` and returned in FIFO order.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response(
///     "GET https://rates.example.com/v1/tax-rates",
///     Ok(HttpResponse { status: 200, body: envelope_json }),
/// );
/// ```
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

enum MockResponse {
    Immediate(MockResult),
    /// Waits for the paired sender to fire (or drop) before completing.
    Triggered {
        response: MockResult,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

impl MockCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a response for `"{METHOD} {url}"`.
    pub fn add_response(&self, key: &str, response: MockResult) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Queue a response that completes only once the returned sender fires or drops.
    pub fn add_response_with_trigger(
        &self,
        key: &str,
        response: MockResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls made for one `"{METHOD} {url}"` key.
    pub fn calls_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| format!("{} {}", c.method, c.url) == key)
            .count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(
        &self,
        request: &HttpRequest,
        timeout_ms: u64,
    ) -> Result<HttpResponse, TransportError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = scopeguard::guard(self.in_flight.clone(), |in_flight| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout_ms,
        });

        let key = format!("{} {}", request.method, request.url);
        let mock_response = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&key)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Dropped sender counts as a trigger too
                let _ = trigger.await;
                response
            }
            None => Err(TransportError::Other(format!(
                "No mock response configured for {}",
                key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://api.example.com/rates";

    #[tokio::test]
    async fn test_mock_client_fifo_and_recording() {
        let mock = MockHttpClient::new();
        let key = format!("GET {}", URL);
        mock.add_response(
            &key,
            Ok(HttpResponse {
                status: 200,
                body: "first".to_string(),
            }),
        );
        mock.add_response(&key, Err(TransportError::Timeout { timeout_ms: 5 }));

        let request = HttpRequest::get(URL)
            .with_headers([("X-License-Number".to_string(), "L1".to_string())]);

        let first = mock.execute(&request, 5000).await.unwrap();
        assert_eq!(first.body, "first");
        let second = mock.execute(&request, 5000).await.unwrap_err();
        assert_eq!(second, TransportError::Timeout { timeout_ms: 5 });

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].header("x-license-number"), Some("L1"));
        assert_eq!(calls[0].timeout_ms, 5000);
        assert_eq!(mock.calls_for(&key), 2);
    }

    #[tokio::test]
    async fn test_mock_client_no_response() {
        let mock = MockHttpClient::new();
        let result = mock.execute(&HttpRequest::get(URL), 5000).await;
        assert!(matches!(result, Err(TransportError::Other(_))));
    }

    #[tokio::test]
    async fn test_mock_client_with_trigger() {
        let mock = MockHttpClient::new();
        let trigger = mock.add_response_with_trigger(
            &format!("POST {}", URL),
            Ok(HttpResponse {
                status: 201,
                body: "triggered".to_string(),
            }),
        );

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move {
            mock_clone
                .execute(&HttpRequest::post_json(URL, "{}".to_string()), 5000)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(mock.in_flight_count(), 0);
    }
}
