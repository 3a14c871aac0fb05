//! Single HTTP exchange over a reusable connection pool. No retries, no parsing.

use std::io::Read;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::operation::Method;

/// A fully prepared request, ready to put on the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Covers the whole exchange, body reads included.
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status plus a live body. The body is read lazily so streams are never buffered here.
pub struct HttpResponse {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            body: Box::new(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body. A failure mid-read is a network failure, not a decode one.
    pub fn into_text(mut self) -> Result<String> {
        let mut bytes = Vec::new();
        self.body
            .read_to_end(&mut bytes)
            .map_err(|e| Error::network(format!("reading response body: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues one exchange. Any failure to get a status line back is `Error::Network`.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Blocking `reqwest` transport. With `keep_alive` the client pools idle
/// connections; without it every exchange opens a fresh connection.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    inner: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(keep_alive: bool, connect_timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder().connect_timeout(connect_timeout);
        if !keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let inner = builder
            .build()
            .map_err(|e| Error::network(format!("building http client: {e}")))?;
        Ok(Self { inner })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut req = self
            .inner
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }
        let resp = req.send().map_err(|e| Error::network(describe(&e)))?;
        Ok(HttpResponse::new(resp.status().as_u16(), resp))
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
