//! Blocking client for an OffGrid LLM server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{ClientConfig, Config};
use crate::engine::RequestEngine;
use crate::error::{Error, Result};
use crate::lazy::LazyShared;
use crate::messages::{
    CacheStats, ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, DownloadProgress,
    DownloadTable, EmbeddingRequest, EmbeddingResponse, HealthInfo, LoadingProgress, ModelInfo,
    ModelList, Transcription,
};
use crate::multipart::MultipartForm;
use crate::operation::Operation;
use crate::progress::{self, WarmOptions, WarmOutcome};
use crate::stream::ChatStream;
use crate::tracker::{Tracker, WaitOutcome};
use crate::transport::Transport;

/// Shape of a transcription response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Text,
    VerboseJson,
}

impl ResponseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::Text => "text",
            ResponseFormat::VerboseJson => "verbose_json",
        }
    }
}

/// Optional fields for [`Client::transcribe`].
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub model: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: ResponseFormat,
}

/// Owns one [`RequestEngine`]; safe to share across threads.
#[derive(Debug)]
pub struct Client {
    engine: RequestEngine,
    loading: Tracker,
    downloads: Tracker,
    default_model: LazyShared<String>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let engine = RequestEngine::new(&config)?;
        Ok(Self::from_parts(engine, &config))
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(ClientConfig::from(config))
    }

    /// Client over a caller-supplied transport (in-process servers, test doubles).
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let engine = RequestEngine::with_transport(&config, transport);
        Self::from_parts(engine, &config)
    }

    fn from_parts(engine: RequestEngine, config: &ClientConfig) -> Self {
        Self {
            engine,
            loading: Tracker::new(config.poll_interval),
            downloads: Tracker::new(config.download_poll_interval),
            default_model: LazyShared::new(),
        }
    }

    pub fn engine(&self) -> &RequestEngine {
        &self.engine
    }

    pub fn base_url(&self) -> &str {
        self.engine.base_url()
    }

    /// `true` only when the server answers and reports itself healthy.
    /// Not retried.
    pub fn health(&self) -> bool {
        let op = Operation::get("/health").without_retry();
        match self.engine.execute(&op).and_then(|e| e.decode::<HealthInfo>()) {
            Ok(info) => info.is_healthy(),
            Err(err) => {
                debug!(error = %err, "health check failed");
                false
            }
        }
    }

    pub fn info(&self) -> Result<HealthInfo> {
        self.engine.execute(&Operation::get("/health"))?.decode()
    }

    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let list: ModelList = self.engine.execute(&Operation::get("/v1/models"))?.decode()?;
        Ok(list.data)
    }

    /// First model the server lists. Looked up once per client.
    pub fn default_model(&self) -> Result<Arc<String>> {
        self.default_model.get_or_try_init(|| {
            let first = self.list_models()?.into_iter().next().ok_or(Error::NoModels)?;
            debug!(model = %first.id, "resolved default model");
            Ok(first.id)
        })
    }

    fn model_or_default(&self, model: Option<&str>) -> Result<String> {
        match model {
            Some(m) => Ok(m.to_string()),
            None => Ok(self.default_model()?.as_str().to_string()),
        }
    }

    fn chat_operation(&self, mut request: ChatRequest, stream: bool) -> Result<Operation> {
        if request.model.is_none() {
            request.model = Some(self.model_or_default(None)?);
        }
        request.stream = stream;
        Operation::post("/v1/chat/completions").json(&request)
    }

    /// Send a chat and return the assistant's reply.
    pub fn chat(&self, request: ChatRequest) -> Result<String> {
        let op = self.chat_operation(request, false)?;
        let response: ChatResponse = self.engine.execute(&op)?.decode()?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::decode("chat response has no choices"))
    }

    /// Send a chat and stream the reply as text fragments.
    pub fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let op = self.chat_operation(request, true)?;
        Ok(ChatStream::new(self.engine.execute_stream(&op)?))
    }

    pub fn complete(
        &self,
        prompt: &str,
        model: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<String> {
        let model = self.model_or_default(model)?;
        let op = Operation::post("/v1/completions").json(&CompletionRequest {
            model: &model,
            prompt,
            max_tokens,
            temperature,
        })?;
        let response: CompletionResponse = self.engine.execute(&op)?.decode()?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or_else(|| Error::decode("completion response has no choices"))
    }

    /// One vector per input, in input order.
    pub fn embed(&self, inputs: &[String], model: Option<&str>) -> Result<Vec<Vec<f32>>> {
        let model = self.model_or_default(model)?;
        let op = Operation::post("/v1/embeddings").json(&EmbeddingRequest {
            model: &model,
            input: inputs,
        })?;
        let response: EmbeddingResponse = self.engine.execute(&op)?.decode()?;
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.engine.execute(&Operation::get("/v1/cache/stats"))?.decode()
    }

    pub fn is_model_cached(&self, model: &str) -> Result<bool> {
        Ok(self.cache_stats()?.has_model(model))
    }

    pub fn loading_progress(&self) -> Result<LoadingProgress> {
        progress::loading_progress(&self.engine)
    }

    pub fn wait_for_ready(
        &self,
        budget: Duration,
        on_progress: impl FnMut(&LoadingProgress),
    ) -> Result<WaitOutcome<LoadingProgress>> {
        progress::wait_for_ready(&self.engine, &self.loading, budget, on_progress)
    }

    pub fn watch_loading(
        &self,
        budget: Duration,
        on_progress: impl FnMut(&LoadingProgress),
    ) -> Result<WaitOutcome<LoadingProgress>> {
        progress::watch_loading(&self.engine, &self.loading, budget, on_progress)
    }

    pub fn warm_model(&self, model: &str, budget: Duration) -> WarmOutcome {
        self.warm_model_with(model, budget, &WarmOptions::default())
    }

    pub fn warm_model_with(&self, model: &str, budget: Duration, options: &WarmOptions) -> WarmOutcome {
        progress::warm_model(&self.engine, &self.loading, model, budget, options)
    }

    pub fn download_progress(&self) -> Result<DownloadTable> {
        progress::download_progress(&self.engine)
    }

    pub fn download_model(
        &self,
        repository: &str,
        file_name: &str,
        budget: Duration,
        on_progress: impl FnMut(&DownloadProgress),
    ) -> Result<WaitOutcome<DownloadProgress>> {
        progress::download_model(
            &self.engine,
            &self.downloads,
            repository,
            file_name,
            budget,
            on_progress,
        )
    }

    /// Upload an audio file for speech-to-text.
    ///
    /// With [`ResponseFormat::Text`] the server's plain-text body becomes
    /// [`Transcription::text`].
    pub fn transcribe(&self, path: &Path, options: &TranscribeOptions) -> Result<Transcription> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        let mut form = MultipartForm::new().file("file", filename, bytes);
        let fields = [
            ("model", options.model.as_deref()),
            ("language", options.language.as_deref()),
            ("prompt", options.prompt.as_deref()),
        ];
        for (name, value) in fields {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                form = form.text(name, value);
            }
        }
        form = form.text("response_format", options.response_format.as_str());

        let op = Operation::post("/v1/audio/transcriptions").raw(form.content_type(), form.into_body());
        match options.response_format {
            ResponseFormat::Text => Ok(Transcription {
                text: self.engine.execute_text(&op)?,
                language: None,
                duration: None,
                segments: Vec::new(),
            }),
            _ => self.engine.execute(&op)?.decode(),
        }
    }
}
