//! Client library for OffGrid LLM servers: a retrying request engine, a
//! server-sent event decoder, bounded progress tracking for long-running
//! server jobs, and a lazily initialized shared slot.
//! Used by the `offgrid-chat` binary.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod lazy;
pub mod messages;
pub mod multipart;
pub mod operation;
pub mod progress;
pub mod stream;
pub mod tracker;
pub mod transport;

pub use client::{Client, ResponseFormat, TranscribeOptions};
pub use config::{default_config_path, ClientConfig, Config, ConfigError};
pub use engine::{Envelope, RequestEngine, RetryPolicy};
pub use error::{Error, Result};
pub use lazy::LazyShared;
pub use messages::{ChatMessage, ChatRequest, DownloadProgress, LoadingPhase, LoadingProgress};
pub use operation::{Method, Operation};
pub use progress::{WarmOptions, WarmOutcome};
pub use stream::{ChatStream, Completion, SseDecoder, StreamEvent};
pub use tracker::{PhaseStatus, Phased, ProgressSource, Tracker, WaitOutcome};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
