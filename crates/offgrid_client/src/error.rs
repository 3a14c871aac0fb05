//! Error taxonomy shared by the engine, the stream decoder and the trackers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Anything a call against the server can fail with.
///
/// Server-supplied `message`, `code` and `details` are carried through
/// verbatim; any context this crate adds is prefixed, never substituted.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not reach the server or complete the exchange.
    #[error("{message}")]
    Network { message: String },

    /// 4xx: the request itself was rejected. Never retried.
    #[error("{message}")]
    Client {
        status: u16,
        message: String,
        code: Option<String>,
        details: Option<String>,
    },

    /// 5xx or an unreadable error body. Retried up to the attempt cap.
    #[error("{message}")]
    Server {
        status: u16,
        message: String,
        code: Option<String>,
        details: Option<String>,
    },

    /// The body arrived but was not shaped as expected.
    #[error("invalid response from server: {message}")]
    Decode { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no models available on the server")]
    NoModels,
}

impl Error {
    pub(crate) fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
        }
    }

    /// Whether the engine may repeat the exchange after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Server { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Client { status, .. } | Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Client { code, .. } | Error::Server { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            Error::Client { details, .. } | Error::Server { details, .. } => details.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::decode(e.to_string())
    }
}
