//! A logical call against the server: method, path and optional body.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Request body. JSON for almost everything, raw bytes for uploads.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(serde_json::Value),
    Raw { content_type: String, bytes: Vec<u8> },
}

/// One request as issued by a caller. Built once, then only read.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    method: Method,
    path: String,
    body: Option<Body>,
    retry: bool,
    deadline: Option<Instant>,
}

impl Operation {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            retry: true,
            deadline: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Attach a JSON payload serialized from `payload`.
    pub fn json<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.body = Some(Body::Json(serde_json::to_value(payload)?));
        Ok(self)
    }

    pub fn raw(mut self, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.body = Some(Body::Raw {
            content_type: content_type.into(),
            bytes,
        });
        self
    }

    /// Fail fast: one attempt only, whatever the engine's retry policy says.
    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Hard stop for every attempt, retry pause and body read of this call.
    /// The engine's own timeout still applies when it is shorter.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn retry(&self) -> bool {
        self.retry
    }

    /// Time left before the deadline; `None` when the call has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|at| at.saturating_duration_since(Instant::now()))
    }
}
