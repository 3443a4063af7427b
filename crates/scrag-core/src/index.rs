//! Index pipeline: chunk → embed → store. Each stage short-circuits the build and the
//! report names the stage that failed.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{ArtifactError, EmbeddingArtifact};
use crate::chunks::{ChunkSet, Chunker, ChunkingError};
use crate::config::Config;
use crate::embed::{build_embedder, EmbedError, Embedder, EmbedderBackend, EmbedderKind, EmbeddingBatch};
use crate::query::{QueryRequest, QueryResponse, RetrievalConfig, Retriever};
use crate::store::{open_store, FileIndexStore, IndexDocument, IndexStore, StorageConfig};
use crate::Metadata;

/// Source keys copied onto every indexed document.
const SOURCE_KEYS: [&str; 5] = ["url", "title", "source", "timestamp", "extractor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Chunk,
    Embed,
    Index,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk => f.write_str("chunk"),
            Self::Embed => f.write_str("embed"),
            Self::Index => f.write_str("index"),
        }
    }
}

/// Outcome of a build. Counts cover the stages that ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub success: bool,
    pub chunks: usize,
    pub embeddings: usize,
    pub indexed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl BuildReport {
    fn failed(stage: Stage, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%stage, error = %message, "index build failed");
        Self {
            failed_stage: Some(stage),
            error_message: Some(message),
            ..Default::default()
        }
    }

    fn with_counts(mut self, chunks: usize, embeddings: usize) -> Self {
        self.chunks = chunks;
        self.embeddings = embeddings;
        self
    }
}

/// Chunker plus embedder, with the storage and retrieval settings used when the
/// pipeline opens an index by path.
#[derive(Debug)]
pub struct IndexPipeline<E> {
    chunker: Chunker,
    embedder: E,
    storage: StorageConfig,
    retrieval: RetrievalConfig,
}

impl IndexPipeline<EmbedderBackend> {
    /// Build from configuration. The embedder still needs [`IndexPipeline::initialize`].
    pub fn from_config(config: &Config, kind: Option<EmbedderKind>) -> Result<Self, IndexError> {
        let chunker = Chunker::new(config.chunking.clone())?;
        let embedder = build_embedder(&config.embeddings, kind)?;
        Ok(Self::new(chunker, embedder)
            .with_storage(config.storage.clone())
            .with_retrieval(config.retrieval.clone()))
    }
}

impl<E: Embedder> IndexPipeline<E> {
    pub fn new(chunker: Chunker, embedder: E) -> Self {
        Self {
            chunker,
            embedder,
            storage: StorageConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Initialize the embedder. Returns its dimension.
    pub async fn initialize(&mut self) -> Result<usize, EmbedError> {
        self.embedder.initialize().await
    }

    /// Chunk, embed and index `text` into the store at `destination`, opened with the
    /// embedder's dimension.
    pub async fn build_index_from_text(&self, text: &str, destination: &Path, source: Metadata) -> BuildReport {
        let (chunks, batch) = match self.chunk_and_embed(text, &source).await {
            Ok(done) => done,
            Err(report) => return report,
        };
        let dimension = self
            .embedder
            .dimension()
            .or_else(|| batch.vectors.first().map(Vec::len))
            .unwrap_or_default();
        let mut store = match open_store(&self.storage, destination, dimension) {
            Ok(store) => store,
            Err(e) => return BuildReport::failed(Stage::Index, e.to_string()).with_counts(chunks.len(), batch.len()),
        };
        index_stage(&mut store, &chunks, batch, &source)
    }

    /// Same as [`Self::build_index_from_text`], against a store the caller owns.
    pub async fn index_into<S>(&self, text: &str, store: &mut S, source: Metadata) -> BuildReport
    where
        S: IndexStore + ?Sized,
    {
        match self.chunk_and_embed(text, &source).await {
            Ok((chunks, batch)) => index_stage(store, &chunks, batch, &source),
            Err(report) => report,
        }
    }

    /// Index previously computed embeddings. Only the index stage runs.
    pub fn index_artifact<S>(&self, artifact: &EmbeddingArtifact, store: &mut S) -> Result<BuildReport, ArtifactError>
    where
        S: IndexStore + ?Sized,
    {
        artifact.validate()?;
        let chunk_meta: Vec<Metadata> = artifact
            .metadata
            .get("chunk_metadata")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_object).cloned().collect())
            .unwrap_or_default();
        let documents = build_documents(
            artifact.chunks.clone(),
            artifact.embeddings.clone(),
            &artifact.metadata,
            &chunk_meta,
        );
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), Value::from("artifact"));
        Ok(add_to_store(store, documents, metadata))
    }

    /// Answer `query` from the file index at `location`. The file's stored dimension
    /// is used when it has one.
    pub async fn query_index(
        &self,
        query: &str,
        location: &Path,
        top_k: Option<usize>,
        threshold: Option<f32>,
    ) -> QueryResponse {
        let store = FileIndexStore::open(location, self.embedder.dimension().unwrap_or_default());
        let mut request = QueryRequest::new(query);
        request.top_k = top_k;
        request.threshold = threshold;
        Retriever::new(&self.embedder, &store)
            .with_config(self.retrieval.clone())
            .query(&request)
            .await
    }

    async fn chunk_and_embed(&self, text: &str, source: &Metadata) -> Result<(ChunkSet, EmbeddingBatch), BuildReport> {
        let chunks = self.chunker.process(text, source);
        if chunks.is_empty() {
            return Err(BuildReport::failed(Stage::Chunk, "content produced no chunks"));
        }

        if !self.embedder.is_available() {
            return Err(BuildReport::failed(
                Stage::Embed,
                format!("{} embedder is not available", self.embedder.name()),
            )
            .with_counts(chunks.len(), 0));
        }
        let batch = match self.embedder.embed(&chunks.texts()).await {
            Ok(batch) => batch,
            Err(e) => return Err(BuildReport::failed(Stage::Embed, e.to_string()).with_counts(chunks.len(), 0)),
        };
        if batch.len() != chunks.len() {
            return Err(BuildReport::failed(
                Stage::Embed,
                format!("expected {} embeddings, got {}", chunks.len(), batch.len()),
            )
            .with_counts(chunks.len(), batch.len()));
        }
        tracing::debug!(chunks = chunks.len(), model = self.embedder.model(), "embedded chunks");
        Ok((chunks, batch))
    }
}

fn index_stage<S>(store: &mut S, chunks: &ChunkSet, batch: EmbeddingBatch, source: &Metadata) -> BuildReport
where
    S: IndexStore + ?Sized,
{
    let chunk_meta: Vec<Metadata> = chunks.chunks.iter().map(|c| c.metadata()).collect();
    let documents = build_documents(chunks.texts(), batch.vectors, source, &chunk_meta);

    let mut metadata = chunks.metadata();
    metadata.remove("chunk_metadata");
    metadata.insert("embedding".into(), Value::Object(batch.metadata));
    let mut report = add_to_store(store, documents, metadata);
    report.chunks = chunks.len();
    report
}

fn add_to_store<S>(store: &mut S, documents: Vec<IndexDocument>, mut metadata: Metadata) -> BuildReport
where
    S: IndexStore + ?Sized,
{
    let count = documents.len();
    let added = match store.add_documents(documents) {
        Ok(added) => added,
        Err(e) => return BuildReport::failed(Stage::Index, e.to_string()).with_counts(count, count),
    };
    if count > 0 && added.indexed() == 0 {
        let reason = added
            .skipped
            .first()
            .map(|s| s.reason.clone())
            .unwrap_or_default();
        return BuildReport::failed(Stage::Index, format!("no documents were indexed: {reason}"))
            .with_counts(count, count);
    }

    metadata.insert("index_store".into(), Value::from(store.name()));
    metadata.insert("skipped".into(), Value::from(added.skipped.len()));
    if let Ok(stats) = serde_json::to_value(store.stats()) {
        metadata.insert("index_stats".into(), stats);
    }
    tracing::info!(
        store = store.name(),
        added = added.added,
        updated = added.updated,
        skipped = added.skipped.len(),
        "indexed documents"
    );
    BuildReport {
        success: true,
        chunks: count,
        embeddings: count,
        indexed: added.indexed(),
        failed_stage: None,
        error_message: None,
        metadata,
    }
}

/// Pair texts with vectors and give each a stable id and the source's metadata.
fn build_documents(
    texts: Vec<String>,
    vectors: Vec<Vec<f32>>,
    source: &Metadata,
    chunk_meta: &[Metadata],
) -> Vec<IndexDocument> {
    texts
        .into_iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, (text, embedding))| {
            let mut metadata = Metadata::new();
            for key in SOURCE_KEYS {
                if let Some(value) = source.get(key) {
                    metadata.insert(key.to_string(), value.clone());
                }
            }
            if let Some(meta) = chunk_meta.get(i) {
                metadata.extend(meta.clone());
            }
            metadata.insert("chunk_index".into(), Value::from(i));
            IndexDocument::new(document_id(source, i), text, embedding).with_metadata(metadata)
        })
        .collect()
}

/// `{url}_chunk_{i}` with `/` and `:` replaced, else `{source}_{i}`, else `doc_{i}`.
fn document_id(source: &Metadata, index: usize) -> String {
    if let Some(url) = source.get("url").and_then(Value::as_str) {
        return format!("{}_chunk_{index}", url.replace(['/', ':'], "_"));
    }
    let prefix = source.get("source").and_then(Value::as_str).unwrap_or("doc");
    format!("{prefix}_{index}")
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid chunking config: {0}")]
    Chunking(#[from] ChunkingError),
    #[error("embedder: {0}")]
    Embed(#[from] EmbedError),
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::chunks::ChunkingConfig;
    use crate::store::MemoryIndexStore;

    /// Letter-frequency vectors over a..=h; deterministic and offline.
    struct LetterEmbedder {
        ready: bool,
        fail: bool,
    }

    fn letters(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; 8];
        for c in text.chars().map(|c| c.to_ascii_lowercase()) {
            if ('a'..='h').contains(&c) {
                v[(c as u8 - b'a') as usize] += 1.0;
            }
        }
        v
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn name(&self) -> &'static str {
            "letters"
        }

        fn model(&self) -> &str {
            "letters-8"
        }

        fn dimension(&self) -> Option<usize> {
            self.ready.then_some(8)
        }

        fn is_available(&self) -> bool {
            self.ready
        }

        async fn initialize(&mut self) -> Result<usize, EmbedError> {
            self.ready = true;
            Ok(8)
        }

        async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbedError> {
            if self.fail {
                return Err(EmbedError::Api {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|t| letters(t)).collect(),
                metadata: Metadata::new(),
            })
        }
    }

    fn pipeline(ready: bool) -> IndexPipeline<LetterEmbedder> {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 60,
            chunk_overlap: 0,
            min_chunk_size: 5,
            ..Default::default()
        })
        .unwrap();
        IndexPipeline::new(chunker, LetterEmbedder { ready, fail: false })
    }

    const TEXT: &str = "A cab faced a bad deed. Hedge funds chase gains. Each bee had a cage.";

    fn source(pairs: Value) -> Metadata {
        pairs.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn ids_prefer_url_then_source() {
        let meta = source(json!({"url": "https://example.com/a/b"}));
        assert_eq!(document_id(&meta, 3), "https___example.com_a_b_chunk_3");
        assert_eq!(document_id(&source(json!({"source": "notes"})), 0), "notes_0");
        assert_eq!(document_id(&Metadata::new(), 1), "doc_1");
    }

    #[tokio::test]
    async fn builds_file_index_with_document_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let p = pipeline(true);
        let src = source(json!({"source": "memo", "title": "Memo", "lang": "en"}));

        let report = p.build_index_from_text(TEXT, &path, src).await;
        assert!(report.success, "{:?}", report.error_message);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.embeddings, 2);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.metadata["index_store"], "file");

        let store = FileIndexStore::open(&path, 8);
        let doc = store.get_document("memo_1").unwrap();
        assert_eq!(doc.metadata["title"], "Memo");
        assert_eq!(doc.metadata["chunk_index"], 1);
        assert_eq!(doc.metadata["chunk_id"], 1);
        assert_eq!(doc.metadata["total_chunks"], 2);
    }

    #[tokio::test]
    async fn rebuilding_updates_in_place() {
        let mut store = MemoryIndexStore::new(8);
        let p = pipeline(true);
        let src = source(json!({"source": "memo"}));
        p.index_into(TEXT, &mut store, src.clone()).await;
        let report = p.index_into(TEXT, &mut store, src).await;
        assert!(report.success);
        assert_eq!(store.stats().total_documents, 2);
    }

    #[tokio::test]
    async fn blank_text_fails_at_chunk_stage() {
        let mut store = MemoryIndexStore::new(8);
        let report = pipeline(true).index_into("  \n ", &mut store, Metadata::new()).await;
        assert!(!report.success);
        assert_eq!(report.failed_stage, Some(Stage::Chunk));
        assert_eq!(report.chunks, 0);
    }

    #[tokio::test]
    async fn unavailable_or_failing_embedder_fails_at_embed_stage() {
        let mut store = MemoryIndexStore::new(8);
        let report = pipeline(false).index_into(TEXT, &mut store, Metadata::new()).await;
        assert_eq!(report.failed_stage, Some(Stage::Embed));
        assert_eq!(report.chunks, 2);
        assert!(report.error_message.unwrap().contains("not available"));

        let mut p = pipeline(true);
        p.embedder.fail = true;
        let report = p.index_into(TEXT, &mut store, Metadata::new()).await;
        assert_eq!(report.failed_stage, Some(Stage::Embed));
        assert!(report.error_message.unwrap().contains("503"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn all_rejected_fails_at_index_stage() {
        let mut store = MemoryIndexStore::new(4);
        let report = pipeline(true).index_into(TEXT, &mut store, Metadata::new()).await;
        assert!(!report.success);
        assert_eq!(report.failed_stage, Some(Stage::Index));
        assert!(report.error_message.unwrap().contains("dimension"));
    }

    #[tokio::test]
    async fn initialize_makes_pipeline_usable() {
        let mut p = pipeline(false);
        assert_eq!(p.initialize().await.unwrap(), 8);
        assert!(p.embedder().is_available());
    }

    #[tokio::test]
    async fn query_index_reads_what_build_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let p = pipeline(true);
        p.build_index_from_text(TEXT, &path, source(json!({"source": "memo"}))).await;

        let response = p.query_index("bee cage", &path, Some(1), None).await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.result_count, 1);
        assert!(response.results[0].content.contains("cage"));

        let response = p.query_index("   ", &path, None, None).await;
        assert_eq!(response.error.as_deref(), Some("empty query"));
    }

    #[test]
    fn artifacts_index_without_embedding() {
        let p = pipeline(false);
        let mut store = MemoryIndexStore::new(2);
        let meta = source(json!({
            "source": "saved",
            "chunk_metadata": [{"chunk_id": 0}, {"chunk_id": 1}],
        }));
        let artifact = EmbeddingArtifact::new(
            vec!["one".into(), "two".into()],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            meta,
        );
        let report = p.index_artifact(&artifact, &mut store).unwrap();
        assert!(report.success);
        assert_eq!(report.indexed, 2);
        assert_eq!(store.get_document("saved_1").unwrap().metadata["chunk_id"], 1);

        let bad = EmbeddingArtifact::new(vec!["one".into()], vec![], Metadata::new());
        assert!(matches!(
            p.index_artifact(&bad, &mut store),
            Err(ArtifactError::LengthMismatch { .. })
        ));
    }
}
