//! Embedding backends. Every backend implements [`Embedder`]; the set of backends is
//! closed and selected by [`EmbedderKind`].
//!
//! Backends go through two phases: construction is cheap and never touches the
//! network or model, [`Embedder::initialize`] acquires what the backend needs and
//! resolves its dimension. Only an initialized, available backend should be asked to
//! embed.

mod ollama;
mod openai;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

pub use ollama::{OllamaConfig, OllamaEmbedder, DEFAULT_BASE_URL, DEFAULT_EMBED_MODEL};
pub use openai::{model_dimension, OpenAiConfig, OpenAiEmbedder, DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL};

/// Vectors for one `embed` call, in input order, plus descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub metadata: Metadata,
}

impl EmbeddingBatch {
    pub fn empty(model: &str) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("model".into(), Value::from(model));
        metadata.insert("count".into(), Value::from(0));
        Self {
            vectors: Vec::new(),
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// Text-to-vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Backend name (e.g. "ollama", "openai").
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    /// Embedding dimension, once known. Never triggers an embedding call.
    fn dimension(&self) -> Option<usize>;

    /// Whether the backend has what it needs to embed right now.
    fn is_available(&self) -> bool;

    /// Acquire resources and resolve the dimension. Safe to call more than once.
    async fn initialize(&mut self) -> Result<usize, EmbedError>;

    /// Embed `texts`, returning exactly one vector per text in the same order, or an
    /// error and no vectors at all.
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbedError>;
}

/// Which backend to build. Parsed from configuration strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Local model served by Ollama.
    Ollama,
    /// Hosted OpenAI-compatible embeddings API.
    OpenAi,
}

impl FromStr for EmbedderKind {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" | "local" => Ok(Self::Ollama),
            "openai" | "hosted" => Ok(Self::OpenAi),
            other => Err(EmbedError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => f.write_str("ollama"),
            Self::OpenAi => f.write_str("openai"),
        }
    }
}

/// Embedding settings for all backends plus the default choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub default_backend: String,
    pub ollama: OllamaConfig,
    pub openai: OpenAiConfig,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            default_backend: EmbedderKind::Ollama.to_string(),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

/// One of the supported backends.
#[derive(Debug)]
pub enum EmbedderBackend {
    Ollama(OllamaEmbedder),
    OpenAi(OpenAiEmbedder),
}

/// Build (but do not initialize) the backend named by `kind`, or by
/// `config.default_backend` when `kind` is `None`.
pub fn build_embedder(
    config: &EmbeddingsConfig,
    kind: Option<EmbedderKind>,
) -> Result<EmbedderBackend, EmbedError> {
    let kind = match kind {
        Some(kind) => kind,
        None => config.default_backend.parse()?,
    };
    tracing::debug!(backend = %kind, "building embedder");
    match kind {
        EmbedderKind::Ollama => Ok(EmbedderBackend::Ollama(OllamaEmbedder::new(&config.ollama)?)),
        EmbedderKind::OpenAi => Ok(EmbedderBackend::OpenAi(OpenAiEmbedder::new(&config.openai)?)),
    }
}

#[async_trait]
impl Embedder for EmbedderBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::Ollama(e) => e.name(),
            Self::OpenAi(e) => e.name(),
        }
    }

    fn model(&self) -> &str {
        match self {
            Self::Ollama(e) => e.model(),
            Self::OpenAi(e) => e.model(),
        }
    }

    fn dimension(&self) -> Option<usize> {
        match self {
            Self::Ollama(e) => e.dimension(),
            Self::OpenAi(e) => e.dimension(),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            Self::Ollama(e) => e.is_available(),
            Self::OpenAi(e) => e.is_available(),
        }
    }

    async fn initialize(&mut self) -> Result<usize, EmbedError> {
        match self {
            Self::Ollama(e) => e.initialize().await,
            Self::OpenAi(e) => e.initialize().await,
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbedError> {
        match self {
            Self::Ollama(e) => e.embed(texts).await,
            Self::OpenAi(e) => e.embed(texts).await,
        }
    }
}

/// Checks a backend response against the request: one vector per input, all the same
/// non-zero length (and equal to `dimension` when known). Returns that length.
pub(crate) fn check_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimension: Option<usize>,
) -> Result<usize, EmbedError> {
    if vectors.len() != expected_count {
        return Err(EmbedError::CountMismatch {
            expected: expected_count,
            actual: vectors.len(),
        });
    }
    let Some(first) = vectors.first() else {
        return Ok(dimension.unwrap_or(0));
    };
    let expected = dimension.unwrap_or(first.len());
    if expected == 0 {
        return Err(EmbedError::EmptyVector);
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(EmbedError::DimensionMismatch {
            expected,
            actual: bad.len(),
        });
    }
    Ok(expected)
}

/// Metadata every backend attaches to a successful batch.
pub(crate) fn batch_metadata(model: &str, dimension: usize, count: usize) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("model".into(), Value::from(model));
    meta.insert("dimension".into(), Value::from(dimension));
    meta.insert("count".into(), Value::from(count));
    meta
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("unknown embedder backend: {0} (expected \"ollama\" or \"openai\")")]
    UnknownBackend(String),
    #[error("{0} embedder is not initialized")]
    NotInitialized(&'static str),
    #[error("OpenAI API key not set. Set OPENAI_API_KEY or configure embeddings.openai.api_key")]
    MissingApiKey,
    #[error("invalid URL: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Ollama request failed: {0}")]
    Ollama(#[from] ollama_rs::error::OllamaError),
    #[error("embedding API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("backend returned an empty embedding")]
    EmptyVector,
}
