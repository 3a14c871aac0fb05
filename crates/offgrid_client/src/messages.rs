//! Typed request and response records for the server's JSON endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Client → server: `/v1/chat/completions` body.
///
/// `model` may be left unset; the client then resolves the server's default model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_knowledge_base: bool,
}

impl ChatRequest {
    /// A single user message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(message)],
            ..Self::default()
        }
    }

    /// A full conversation, sent as-is.
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Prepend a system prompt.
    pub fn system(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(0, ChatMessage::system(prompt));
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn use_knowledge_base(mut self, enabled: bool) -> Self {
        self.use_knowledge_base = enabled;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

/// One streamed chat frame; only the text delta matters to callers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatChunk {
    pub fn into_delta_content(self) -> Option<String> {
        self.choices.into_iter().next()?.delta.content
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub quantization: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub data: Vec<ModelInfo>,
}

/// `/health` body.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime: Option<String>,
}

impl HealthInfo {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadedModel {
    #[serde(alias = "model_id")]
    pub id: String,
    #[serde(default)]
    pub size_mb: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCacheStats {
    #[serde(default)]
    pub cached_models: Vec<LoadedModel>,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub current_count: Option<u32>,
}

/// `/v1/cache/stats` body. Servers report loaded models either at the top
/// level (`loaded_models`) or nested under `model_cache.cached_models`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheStats {
    #[serde(default)]
    pub loaded_models: Vec<LoadedModel>,
    #[serde(default)]
    pub model_cache: Option<ModelCacheStats>,
}

impl CacheStats {
    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        let nested = self
            .model_cache
            .iter()
            .flat_map(|c| c.cached_models.iter());
        self.loaded_models
            .iter()
            .chain(nested)
            .map(|m| m.id.as_str())
    }

    /// Exact id match, or an id the server decorated around `model`.
    pub fn has_model(&self, model: &str) -> bool {
        self.model_ids().any(|id| id == model || id.contains(model))
    }
}

/// Server-side model loading phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingPhase {
    #[default]
    Idle,
    Unloading,
    Starting,
    Loading,
    Warmup,
    Ready,
    Failed,
    #[serde(other)]
    Unknown,
}

impl LoadingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadingPhase::Ready | LoadingPhase::Failed)
    }
}

/// `/v1/loading/progress` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LoadingProgress {
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub phase: LoadingPhase,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub estimated_ms: u64,
    #[serde(default)]
    pub is_warm: bool,
    #[serde(default)]
    pub size_mb: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Downloading,
    Complete,
    Failed,
    #[serde(other)]
    Unknown,
}

/// One row of the download progress table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DownloadProgress {
    #[serde(default, alias = "file_name")]
    pub filename: String,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default)]
    pub bytes_total: u64,
    #[serde(default)]
    pub status: DownloadStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// `/v1/models/download/progress`: filename → progress.
pub type DownloadTable = HashMap<String, DownloadProgress>;

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRequest<'a> {
    pub repository: &'a str,
    pub file_name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSegment {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

/// Server → client: error body, `{error: {...}}` or `{error: "..."}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorField,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorField {
    Detailed {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<serde_json::Value>,
        #[serde(default)]
        details: Option<serde_json::Value>,
    },
    Text(String),
}

impl ErrorField {
    /// Message (absent when empty), code and details as text.
    pub(crate) fn into_parts(self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            ErrorField::Detailed {
                message,
                code,
                details,
            } => (
                message.filter(|m| !m.is_empty()),
                field_text(code),
                field_text(details),
            ),
            ErrorField::Text(message) => (Some(message).filter(|m| !m.is_empty()), None, None),
        }
    }
}

/// Scalars as-is, anything else as compact JSON; empty strings are absent.
fn field_text(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
