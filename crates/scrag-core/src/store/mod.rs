//! Vector index stores: documents with embeddings, searchable by cosine similarity.
//!
//! [`MemoryIndexStore`] holds the documents and the dense embedding matrix;
//! [`FileIndexStore`] wraps it and persists every mutation to a JSON file with an
//! atomic rename. [`IndexBackend`] is the closed set of backends, picked by
//! [`StoreKind`].

mod file;
mod matrix;
mod memory;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

pub use file::FileIndexStore;
pub use matrix::{cosine_similarity, dot, normalize, EmbeddingMatrix};
pub use memory::MemoryIndexStore;

pub const DEFAULT_TOP_K: usize = 10;

/// The unit of storage: chunk content plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl IndexDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Similarity search request against a store.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub embedding: Vec<f32>,
    /// Maximum results returned.
    pub top_k: usize,
    /// Minimum cosine similarity, in [-1, 1].
    pub threshold: f32,
    /// Exact-match constraints on document metadata, all of which must hold.
    pub filters: Metadata,
}

impl SearchQuery {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            top_k: DEFAULT_TOP_K,
            threshold: 0.0,
            filters: Metadata::new(),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_filters(mut self, filters: Metadata) -> Self {
        self.filters = filters;
        self
    }

    /// True when every filter key is present in `metadata` with an equal value.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.filters
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub document: IndexDocument,
    /// Cosine similarity, in [-1, 1].
    pub score: f32,
    pub metadata: Metadata,
}

/// Outcome of an `add_documents` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: Vec<SkippedDocument>,
}

impl AddReport {
    /// Documents now present in the store from this batch.
    pub fn indexed(&self) -> usize {
        self.added + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_documents: usize,
    pub embedding_dimension: usize,
    pub index_path: Option<PathBuf>,
    /// Size of the backing file; 0 when there is none.
    pub index_size_bytes: u64,
}

impl IndexStats {
    pub fn index_size_mb(&self) -> f64 {
        self.index_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Storage backend for indexed documents.
pub trait IndexStore {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Embedding length every stored document must have.
    fn dimension(&self) -> usize;

    /// Insert new documents and replace existing ids in place. Documents whose
    /// embedding does not fit the store are skipped and listed in the report.
    fn add_documents(&mut self, documents: Vec<IndexDocument>) -> Result<AddReport, StoreError>;

    /// Best matches first.
    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, StoreError>;

    fn get_document(&self, id: &str) -> Option<&IndexDocument>;

    /// Returns false when `id` is not in the store.
    fn delete_document(&mut self, id: &str) -> Result<bool, StoreError>;

    fn stats(&self) -> IndexStats;

    /// Remove every document, and the backing file if there is one.
    fn clear(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    File,
    Memory,
}

impl FromStr for StoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(StoreError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    /// Create the index directory on first write when it does not exist.
    pub create_if_missing: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreKind::File.to_string(),
            create_if_missing: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum IndexBackend {
    File(FileIndexStore),
    Memory(MemoryIndexStore),
}

/// Open the store named by `config.backend`. The file backend loads `path` if present.
pub fn open_store(config: &StorageConfig, path: &Path, dimension: usize) -> Result<IndexBackend, StoreError> {
    let kind: StoreKind = config.backend.parse()?;
    Ok(match kind {
        StoreKind::File => IndexBackend::File(
            FileIndexStore::open(path, dimension).create_if_missing(config.create_if_missing),
        ),
        StoreKind::Memory => IndexBackend::Memory(MemoryIndexStore::new(dimension)),
    })
}

impl IndexStore for IndexBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::File(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            Self::File(s) => s.is_available(),
            Self::Memory(s) => s.is_available(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            Self::File(s) => s.dimension(),
            Self::Memory(s) => s.dimension(),
        }
    }

    fn add_documents(&mut self, documents: Vec<IndexDocument>) -> Result<AddReport, StoreError> {
        match self {
            Self::File(s) => s.add_documents(documents),
            Self::Memory(s) => s.add_documents(documents),
        }
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, StoreError> {
        match self {
            Self::File(s) => s.search(query),
            Self::Memory(s) => s.search(query),
        }
    }

    fn get_document(&self, id: &str) -> Option<&IndexDocument> {
        match self {
            Self::File(s) => s.get_document(id),
            Self::Memory(s) => s.get_document(id),
        }
    }

    fn delete_document(&mut self, id: &str) -> Result<bool, StoreError> {
        match self {
            Self::File(s) => s.delete_document(id),
            Self::Memory(s) => s.delete_document(id),
        }
    }

    fn stats(&self) -> IndexStats {
        match self {
            Self::File(s) => s.stats(),
            Self::Memory(s) => s.stats(),
        }
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match self {
            Self::File(s) => s.clear(),
            Self::Memory(s) => s.clear(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown index store backend: {0} (expected \"file\" or \"memory\")")]
    UnknownBackend(String),
    #[error("query embedding has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("failed to read index {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("index file {0} is not valid JSON: {1}")]
    Corrupt(PathBuf, serde_json::Error),
    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write index {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to remove index {0}: {1}")]
    Remove(PathBuf, std::io::Error),
}
