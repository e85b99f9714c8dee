use crate::cancel::CancelToken;
use crate::config::HttpSettings;
use crate::error::LaunchError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// The raw HTTP seam. Production uses reqwest; tests plug in canned responses.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &HttpSettings) -> Result<Self, LaunchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_sec))
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    fn convert(response: reqwest::blocking::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|text| (key.as_str().to_string(), text.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .map_err(|err| TransportError(err.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TransportError(err.to_string()))?;
        Self::convert(response)
    }

    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.post(url).body(body.to_vec());
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request
            .send()
            .map_err(|err| TransportError(err.to_string()))?;
        Self::convert(response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1_u32 << shift);
        scaled.min(self.max_delay)
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

#[derive(Clone)]
pub struct RetryingHttpClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl RetryingHttpClient {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self {
            transport,
            policy,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>, LaunchError> {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(LaunchError::Cancelled);
            }
            match self.transport.get(url) {
                Ok(response) if response.is_success() => {
                    debug!(url, attempt, bytes = response.body.len(), "fetched");
                    return Ok(response.body);
                }
                Ok(response) if !is_retryable_status(response.status) => {
                    return Err(LaunchError::Http {
                        url: url.to_string(),
                        status: response.status,
                    });
                }
                Ok(response) => last_error = format!("HTTP {}", response.status),
                Err(err) => last_error = err.to_string(),
            }
            if attempt < self.policy.max_attempts {
                let delay = self.policy.delay_after(attempt);
                warn!(
                    url,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "request failed, retrying"
                );
                if !self.cancel.sleep(delay) {
                    return Err(LaunchError::Cancelled);
                }
            }
        }
        Err(LaunchError::TransientNetwork {
            url: url.to_string(),
            attempts: self.policy.max_attempts,
            message: last_error,
        })
    }

    pub fn get_string(&self, url: &str) -> Result<String, LaunchError> {
        let bytes = self.get_bytes(url)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn get_json(&self, url: &str) -> Result<serde_json::Value, LaunchError> {
        let bytes = self.get_bytes(url)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: &'static str,
        pub url: String,
        pub headers: Vec<(String, String)>,
    }

    /// Routes requests by exact URL. Each route replays its queued responses in
    /// order and repeats the last one once the queue is down to a single item.
    #[derive(Default)]
    pub struct StubTransport {
        routes: Mutex<BTreeMap<String, VecDeque<Result<HttpResponse, String>>>>,
        requests: Mutex<Vec<RecordedRequest>>,
    }

    impl StubTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url: &str, status: u16, body: &[u8]) -> &Self {
            self.respond_with_headers(url, status, &[], body)
        }

        pub fn respond_with_headers(
            &self,
            url: &str,
            status: u16,
            headers: &[(&str, &str)],
            body: &[u8],
        ) -> &Self {
            let response = HttpResponse {
                status,
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: body.to_vec(),
            };
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Ok(response));
            self
        }

        pub fn fail(&self, url: &str, message: &str) -> &Self {
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Err(message.to_string()));
            self
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn count(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|request| request.url == url)
                .count()
        }

        fn next(&self, url: &str) -> Result<HttpResponse, TransportError> {
            let mut routes = self.routes.lock().unwrap();
            let Some(queue) = routes.get_mut(url) else {
                return Ok(HttpResponse {
                    status: 404,
                    headers: Vec::new(),
                    body: Vec::new(),
                });
            };
            let item = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            };
            item.map_err(TransportError)
        }
    }

    impl HttpTransport for StubTransport {
        fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(RecordedRequest {
                method: "GET",
                url: url.to_string(),
                headers: Vec::new(),
            });
            self.next(url)
        }

        fn post(
            &self,
            url: &str,
            headers: &[(String, String)],
            _body: &[u8],
        ) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(RecordedRequest {
                method: "POST",
                url: url.to_string(),
                headers: headers.to_vec(),
            });
            self.next(url)
        }
    }

    pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    pub fn client(transport: Arc<StubTransport>, max_attempts: u32) -> RetryingHttpClient {
        RetryingHttpClient::new(transport, fast_policy(max_attempts), CancelToken::new())
    }
}
