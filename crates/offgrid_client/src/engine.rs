//! Request engine: header injection, JSON envelopes and linear-backoff retries
//! on top of a [`Transport`].

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::messages::ErrorBody;
use crate::operation::{Body, Operation};
use crate::stream::{EventStream, SseDecoder};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Transport};

const JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";

/// Attempt cap plus linear backoff: the pause after attempt `n` (0-based) is
/// `base_delay * (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

/// Decoded JSON body of a successful non-streaming response.
///
/// Only lives at the decode boundary; callers get typed records via [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Value);

impl Envelope {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.0).map_err(Error::from)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

type Sleep = Arc<dyn Fn(Duration) + Send + Sync>;

/// Every call to the server goes through here.
#[derive(Clone)]
pub struct RequestEngine {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    keep_alive: bool,
    retry: RetryPolicy,
    sleep: Sleep,
}

impl RequestEngine {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.keep_alive, config.timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout: config.timeout,
            keep_alive: config.keep_alive,
            retry: config.retry_policy(),
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the pause used between retries.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) fn pause(&self, duration: Duration) {
        (self.sleep)(duration)
    }

    /// Run a non-streaming operation and decode its JSON body.
    pub fn execute(&self, op: &Operation) -> Result<Envelope> {
        self.with_retries(op, false, |response| {
            let text = response.into_text()?;
            if text.trim().is_empty() {
                return Ok(Envelope(Value::Object(Default::default())));
            }
            let value = serde_json::from_str(&text)
                .map_err(|e| Error::decode(format!("{} {}: {e}", op.method().as_str(), op.path())))?;
            Ok(Envelope(value))
        })
    }

    /// Like [`execute`](Self::execute) but returns the raw response text.
    pub fn execute_text(&self, op: &Operation) -> Result<String> {
        self.with_retries(op, false, HttpResponse::into_text)
    }

    /// Open a streaming exchange. Retries only cover getting a 2xx status;
    /// once the body is handed to the decoder nothing is repeated.
    pub fn execute_stream(&self, op: &Operation) -> Result<EventStream> {
        self.with_retries(op, true, |response| {
            Ok(SseDecoder::new(BufReader::new(response.body)))
        })
    }

    fn with_retries<T>(
        &self,
        op: &Operation,
        stream: bool,
        mut finish: impl FnMut(HttpResponse) -> Result<T>,
    ) -> Result<T> {
        let attempts = if op.retry() {
            self.retry.max_attempts()
        } else {
            1
        };
        let mut last_error = None;
        for attempt in 0..attempts {
            if op.remaining() == Some(Duration::ZERO) {
                debug!(
                    method = op.method().as_str(),
                    path = op.path(),
                    attempt = attempt + 1,
                    "deadline reached, not sending"
                );
                break;
            }
            debug!(
                method = op.method().as_str(),
                path = op.path(),
                attempt = attempt + 1,
                attempts,
                "sending request"
            );
            match self.attempt(op, stream).and_then(&mut finish) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempt + 1 < attempts {
                        let delay = self.retry.delay_after(attempt);
                        let delay = op.remaining().map_or(delay, |left| delay.min(left));
                        warn!(
                            method = op.method().as_str(),
                            path = op.path(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "request failed, retrying"
                        );
                        self.pause(delay);
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        let err = last_error.unwrap_or_else(|| {
            Error::network(format!(
                "{} {}: deadline passed before the request was sent",
                op.method().as_str(),
                op.path()
            ))
        });
        warn!(
            method = op.method().as_str(),
            path = op.path(),
            attempts,
            error = %err,
            "request failed"
        );
        Err(err)
    }

    fn attempt(&self, op: &Operation, stream: bool) -> Result<HttpResponse> {
        let request = self.prepare(op, stream);
        let response = self.transport.send(request).map_err(|err| match err {
            Error::Network { message } => Error::network(format!(
                "cannot reach server at {}: {message}",
                self.base_url
            )),
            other => other,
        })?;
        if response.is_success() {
            return Ok(response);
        }
        let status = response.status;
        let text = response.into_text().unwrap_or_default();
        Err(error_from_status(status, &text))
    }

    fn prepare(&self, op: &Operation, stream: bool) -> HttpRequest {
        let mut headers = Vec::with_capacity(4);
        let (content_type, body) = match op.body() {
            Some(Body::Json(value)) => (JSON.to_string(), Some(value.to_string().into_bytes())),
            Some(Body::Raw {
                content_type,
                bytes,
            }) => (content_type.clone(), Some(bytes.clone())),
            None => (JSON.to_string(), None),
        };
        headers.push(("Content-Type".to_string(), content_type));
        let accept = if stream { EVENT_STREAM } else { JSON };
        headers.push(("Accept".to_string(), accept.to_string()));
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        headers.push(("Connection".to_string(), connection.to_string()));
        if let Some(key) = &self.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {}", key.trim())));
        }
        HttpRequest {
            method: op.method(),
            url: format!("{}{}", self.base_url, op.path()),
            headers,
            body,
            timeout: op
                .remaining()
                .map_or(self.timeout, |left| left.min(self.timeout)),
        }
    }
}

impl std::fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEngine")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.api_key.is_some())
            .field("timeout", &self.timeout)
            .field("keep_alive", &self.keep_alive)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Map a non-2xx response to `Client` (4xx) or `Server` (everything else).
fn error_from_status(status: u16, text: &str) -> Error {
    let (message, code, details) = match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => {
            let (message, code, details) = body.error.into_parts();
            (message.unwrap_or_else(|| format!("HTTP {status}")), code, details)
        }
        Err(_) => {
            let body = text.trim();
            let message = if body.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {body}")
            };
            (message, None, None)
        }
    };
    if (400..500).contains(&status) {
        Error::Client {
            status,
            message,
            code,
            details,
        }
    } else {
        Error::Server {
            status,
            message,
            code,
            details,
        }
    }
}
