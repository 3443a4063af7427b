//! Hosted embeddings through the OpenAI `/v1/embeddings` endpoint. Works with any
//! OpenAI-compatible embedding API (Azure OpenAI, local gateways).
//!
//! Inputs are sent in batches of `batch_size`; up to `max_concurrent_batches` requests
//! are in flight at once. Output order always matches input order.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{batch_metadata, check_vectors, EmbedError, Embedder, EmbeddingBatch};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const API_KEY_ENV: &str = "OPENAI_API_KEY";
const FALLBACK_DIMENSION: usize = 1536;

/// Output dimension of the known OpenAI embedding models.
pub fn model_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// API key. Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Requested output dimension. Needed for models outside the built-in table.
    pub dimension: Option<usize>,
    /// Maximum texts per request.
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            dimension: None,
            batch_size: 100,
            max_concurrent_batches: 1,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("batch_size", &self.batch_size)
            .field("max_concurrent_batches", &self.max_concurrent_batches)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Picks the configured key, else the environment's. Blank keys count as missing.
fn resolve_api_key(configured: Option<&str>, from_env: Option<String>) -> Option<String> {
    configured
        .map(str::to_string)
        .filter(|k| !k.trim().is_empty())
        .or(from_env)
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Embedder for OpenAI-compatible HTTP APIs.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    requested_dimensions: Option<usize>,
    batch_size: usize,
    max_concurrent_batches: usize,
    timeout: Duration,
}

impl fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("endpoint", &self.endpoint)
            .field("has_api_key", &self.api_key.is_some())
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl OpenAiEmbedder {
    pub fn new(config: &OpenAiConfig) -> Result<Self, EmbedError> {
        url::Url::parse(&config.base_url)?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let api_key = resolve_api_key(config.api_key.as_deref(), std::env::var(API_KEY_ENV).ok());
        let dimension = config
            .dimension
            .or_else(|| model_dimension(&config.model))
            .unwrap_or(FALLBACK_DIMENSION);

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            dimension,
            requested_dimensions: config.dimension,
            batch_size: config.batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            timeout,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn request(&self, api_key: &str, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = EmbeddingsRequest {
            model: &self.model,
            input: batch,
            dimensions: self.requested_dimensions,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(EmbedError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingsResponse = response.json().await.map_err(|e| self.http_error(e))?;
        // Responses may arrive out of order; `index` is authoritative.
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        check_vectors(&vectors, batch.len(), Some(self.dimension))?;
        Ok(vectors)
    }

    fn http_error(&self, e: reqwest::Error) -> EmbedError {
        if e.is_timeout() {
            EmbedError::Timeout(self.timeout)
        } else {
            EmbedError::Http(e)
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn initialize(&mut self) -> Result<usize, EmbedError> {
        if self.api_key.is_none() {
            return Err(EmbedError::MissingApiKey);
        }
        Ok(self.dimension)
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbedError> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch::empty(&self.model));
        }
        let api_key = self.api_key.as_deref().ok_or(EmbedError::MissingApiKey)?;

        // `buffered` yields in submission order, so batches come back in input order.
        let requests: Vec<_> = texts
            .chunks(self.batch_size)
            .map(|batch| self.request(api_key, batch))
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = futures::stream::iter(requests)
            .buffered(self.max_concurrent_batches)
            .try_collect()
            .await
            .inspect_err(|e| {
                tracing::error!(model = %self.model, error = %e, "OpenAI embedding failed");
            })?;

        let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
        check_vectors(&vectors, texts.len(), Some(self.dimension))?;

        let mut metadata = batch_metadata(&self.model, self.dimension, vectors.len());
        metadata.insert("backend".into(), Value::from(self.name()));
        metadata.insert("batch_size".into(), Value::from(self.batch_size));
        tracing::debug!(count = vectors.len(), model = %self.model, "embedded batch");
        Ok(EmbeddingBatch { vectors, metadata })
    }
}

// -- OpenAI API request/response types --

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
