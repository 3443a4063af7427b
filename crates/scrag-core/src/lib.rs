//! All indexing and retrieval logic independent of how it is run.
//!
//! Text is split by the [chunks] module, turned into vectors by an [embed] backend,
//! stored in an [store] index and searched through [query]. The [index] pipeline ties
//! the stages together. Scrag keeps its own config and indices in the app data
//! directory (see [app_data]).

pub mod app_data;
pub mod artifact;
pub mod chunks;
pub mod config;
pub mod embed;
pub mod index;
pub mod logging;
pub mod query;
pub mod sources;
pub mod store;

/// Free-form JSON metadata attached to chunks, documents and results.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub use app_data::app_data_dir;
pub use artifact::{ArtifactError, EmbeddingArtifact};
pub use chunks::{Chunk, ChunkSet, Chunker, ChunkingConfig, ChunkingError};
pub use config::{
    default_index_path, load_config, load_config_file, load_layered, save_config, Config, ConfigError,
};
pub use embed::{
    build_embedder, EmbedError, Embedder, EmbedderBackend, EmbedderKind, EmbeddingBatch, EmbeddingsConfig,
    OllamaConfig, OllamaEmbedder, OpenAiConfig, OpenAiEmbedder,
};
pub use index::{BuildReport, IndexError, IndexPipeline, Stage};
pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
pub use query::{QueryRequest, QueryResponse, RetrievalConfig, RetrievedChunk, Retriever};
pub use sources::{load_sources, SourceDocument, SourceError};
pub use store::{
    open_store, AddReport, FileIndexStore, IndexBackend, IndexDocument, IndexStats, IndexStore,
    MemoryIndexStore, SearchQuery, SearchResult, StorageConfig, StoreError, StoreKind,
};

/// Returns a short status string. Used to verify the library is wired up.
pub fn status() -> &'static str {
    "scrag-core ready"
}

