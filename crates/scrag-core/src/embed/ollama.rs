//! Local-model embeddings served by Ollama. Wraps ollama-rs with the [`Embedder`] API.

use std::time::Duration;

use async_trait::async_trait;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{batch_metadata, check_vectors, EmbedError, Embedder, EmbeddingBatch};

pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Text embedded once during initialization to learn the model's dimension.
const PROBE_TEXT: &str = "sample";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    /// Embedding model (e.g. `nomic-embed-text`, `all-minilm`).
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_EMBED_MODEL.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Constructed,
    Ready { dimension: usize },
}

/// Embedder backed by a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    inner: Ollama,
    embed_model: String,
    timeout: Duration,
    state: LoadState,
}

impl OllamaEmbedder {
    /// Create from config. Only parses the URL; the server is not contacted until
    /// [`Embedder::initialize`].
    pub fn new(config: &OllamaConfig) -> Result<Self, EmbedError> {
        let inner = Ollama::try_new(config.base_url.as_str()).map_err(EmbedError::ParseUrl)?;
        Ok(Self {
            inner,
            embed_model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            state: LoadState::Constructed,
        })
    }

    /// Set the embedding model. Resets the embedder to the constructed state.
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self.state = LoadState::Constructed;
        self
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let input = match texts {
            [single] => EmbeddingsInput::Single(single.clone()),
            _ => EmbeddingsInput::Multiple(texts.to_vec()),
        };
        let req = GenerateEmbeddingsRequest::new(self.embed_model.clone(), input);
        let res = tokio::time::timeout(self.timeout, self.inner.generate_embeddings(req))
            .await
            .map_err(|_| EmbedError::Timeout(self.timeout))??;
        Ok(res.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.embed_model
    }

    fn dimension(&self) -> Option<usize> {
        match self.state {
            LoadState::Ready { dimension } => Some(dimension),
            LoadState::Constructed => None,
        }
    }

    fn is_available(&self) -> bool {
        matches!(self.state, LoadState::Ready { .. })
    }

    async fn initialize(&mut self) -> Result<usize, EmbedError> {
        if let LoadState::Ready { dimension } = self.state {
            return Ok(dimension);
        }
        let probe = self.request(&[PROBE_TEXT.to_string()]).await?;
        let dimension = check_vectors(&probe, 1, None)?;
        self.state = LoadState::Ready { dimension };
        tracing::info!(model = %self.embed_model, dimension, "loaded Ollama embedding model");
        Ok(dimension)
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbedError> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch::empty(&self.embed_model));
        }
        let LoadState::Ready { dimension } = self.state else {
            return Err(EmbedError::NotInitialized(self.name()));
        };

        let vectors = self.request(texts).await.inspect_err(|e| {
            tracing::error!(model = %self.embed_model, error = %e, "Ollama embedding failed");
        })?;
        check_vectors(&vectors, texts.len(), Some(dimension))?;

        let mut metadata = batch_metadata(&self.embed_model, dimension, vectors.len());
        metadata.insert("backend".into(), Value::from(self.name()));
        Ok(EmbeddingBatch { vectors, metadata })
    }
}
