//! Query orchestration: embed the question, search the index, format what came back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::embed::Embedder;
use crate::store::{IndexStore, SearchQuery, SearchResult, DEFAULT_TOP_K};
use crate::Metadata;

const RESULT_SEPARATOR: &str = "\n\n---\n\n";

/// Defaults applied to requests that leave a field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub threshold: f32,
    pub include_scores: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: 0.0,
            include_scores: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub text: String,
    pub top_k: Option<usize>,
    pub threshold: Option<f32>,
    pub filters: Metadata,
    pub include_scores: Option<bool>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_scores(mut self, include: bool) -> Self {
        self.include_scores = Some(include);
        self
    }
}

/// One formatted hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<RetrievedChunk>,
    pub result_count: usize,
    /// Result contents in rank order, each under a `[Result N]` header.
    pub retrieved_content: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Effective parameters and backend names.
    #[serde(default)]
    pub metadata: Metadata,
}

impl QueryResponse {
    pub fn failure(query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            results: Vec::new(),
            result_count: 0,
            retrieved_content: String::new(),
            success: false,
            error: Some(error.into()),
            metadata: Metadata::new(),
        }
    }
}

/// Answers queries against one embedder and one store. Holds no state of its own,
/// so repeated queries give the same answer.
pub struct Retriever<'a, E: ?Sized, S: ?Sized> {
    embedder: &'a E,
    store: &'a S,
    config: RetrievalConfig,
}

impl<'a, E, S> Retriever<'a, E, S>
where
    E: Embedder + ?Sized,
    S: IndexStore + ?Sized,
{
    pub fn new(embedder: &'a E, store: &'a S) -> Self {
        Self {
            embedder,
            store,
            config: RetrievalConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn query(&self, request: &QueryRequest) -> QueryResponse {
        let text = request.text.trim();
        if text.is_empty() {
            return QueryResponse::failure(&request.text, "empty query");
        }
        if !self.embedder.is_available() {
            return QueryResponse::failure(
                text,
                format!("{} embedder is not available", self.embedder.name()),
            );
        }

        let batch = match self.embedder.embed(&[text.to_string()]).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "failed to embed query");
                return QueryResponse::failure(text, format!("failed to generate query embedding: {e}"));
            }
        };
        let Some(embedding) = batch.vectors.into_iter().next() else {
            return QueryResponse::failure(text, "failed to generate query embedding");
        };

        let top_k = request.top_k.unwrap_or(self.config.top_k);
        let threshold = request.threshold.unwrap_or(self.config.threshold);
        let include_scores = request.include_scores.unwrap_or(self.config.include_scores);
        let search = SearchQuery::new(embedding)
            .with_top_k(top_k)
            .with_threshold(threshold)
            .with_filters(request.filters.clone());

        let hits = match self.store.search(&search) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!(error = %e, "index search failed");
                return QueryResponse::failure(text, e.to_string());
            }
        };
        tracing::debug!(query = text, results = hits.len(), top_k, threshold, "query answered");

        let mut metadata = Metadata::new();
        metadata.insert("top_k".into(), Value::from(top_k));
        metadata.insert("threshold".into(), Value::from(threshold));
        metadata.insert("embedder".into(), Value::from(self.embedder.name()));
        metadata.insert("index_store".into(), Value::from(self.store.name()));

        QueryResponse {
            query: text.to_string(),
            result_count: hits.len(),
            retrieved_content: combine_content(&hits, include_scores),
            results: hits.into_iter().map(|hit| format_hit(hit, include_scores)).collect(),
            success: true,
            error: None,
            metadata,
        }
    }
}

fn format_hit(hit: SearchResult, include_scores: bool) -> RetrievedChunk {
    RetrievedChunk {
        id: hit.document.id,
        content: hit.document.content,
        metadata: hit.document.metadata,
        score: include_scores.then_some(hit.score),
    }
}

fn combine_content(hits: &[SearchResult], include_scores: bool) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            let header = if include_scores {
                format!("[Result {}, Score: {:.3}]", i + 1, hit.score)
            } else {
                format!("[Result {}]", i + 1)
            };
            format!("{header}\n{}", hit.document.content)
        })
        .collect::<Vec<_>>()
        .join(RESULT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::embed::{EmbedError, EmbeddingBatch};
    use crate::store::{IndexDocument, MemoryIndexStore};

    /// Maps known words to fixed axes; counts calls.
    struct AxisEmbedder {
        calls: AtomicUsize,
        available: bool,
    }

    impl AxisEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                available: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn name(&self) -> &'static str {
            "axis"
        }

        fn model(&self) -> &str {
            "axis-3"
        }

        fn dimension(&self) -> Option<usize> {
            Some(3)
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn initialize(&mut self) -> Result<usize, EmbedError> {
            Ok(3)
        }

        async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let vectors = texts
                .iter()
                .map(|t| match t.as_str() {
                    "rust" => vec![1.0, 0.0, 0.0],
                    "cooking" => vec![0.0, 1.0, 0.0],
                    _ => vec![0.0, 0.0, 1.0],
                })
                .collect();
            Ok(EmbeddingBatch {
                vectors,
                metadata: Metadata::new(),
            })
        }
    }

    fn store() -> MemoryIndexStore {
        let mut store = MemoryIndexStore::new(3);
        let mut ai = Metadata::new();
        ai.insert("topic".into(), "ai".into());
        store
            .add_documents(vec![
                IndexDocument::new("r1", "Ownership rules.", vec![1.0, 0.0, 0.0]).with_metadata(ai),
                IndexDocument::new("r2", "Borrow checker.", vec![0.9, 0.1, 0.0]),
                IndexDocument::new("c1", "Knife skills.", vec![0.0, 1.0, 0.0]),
            ])
            .unwrap();
        store
    }

    #[tokio::test]
    async fn empty_query_fails_without_embedding() {
        let embedder = AxisEmbedder::new();
        let store = store();
        let retriever = Retriever::new(&embedder, &store);

        for text in ["", "   \n"] {
            let response = retriever.query(&QueryRequest::new(text)).await;
            assert!(!response.success);
            assert_eq!(response.result_count, 0);
            assert_eq!(response.error.as_deref(), Some("empty query"));
        }
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_embedder_is_not_called() {
        let embedder = AxisEmbedder {
            available: false,
            ..AxisEmbedder::new()
        };
        let store = store();
        let response = Retriever::new(&embedder, &store).query(&QueryRequest::new("rust")).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not available"));
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn formats_ranked_results_with_scores() {
        let embedder = AxisEmbedder::new();
        let store = store();
        let response = Retriever::new(&embedder, &store)
            .query(&QueryRequest::new("  rust ").with_top_k(2).with_threshold(0.5))
            .await;

        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.query, "rust");
        assert_eq!(response.result_count, 2);
        let ids: Vec<_> = response.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(response.results[0].score, Some(1.0));
        assert_eq!(response.results[0].metadata["topic"], "ai");
        assert!(response
            .retrieved_content
            .starts_with("[Result 1, Score: 1.000]\nOwnership rules.\n\n---\n\n[Result 2, Score: 0.99"));
        assert_eq!(response.metadata["embedder"], "axis");
        assert_eq!(response.metadata["index_store"], "memory");
    }

    #[tokio::test]
    async fn scores_can_be_left_out() {
        let embedder = AxisEmbedder::new();
        let store = store();
        let response = Retriever::new(&embedder, &store)
            .query(&QueryRequest::new("cooking").with_top_k(1).with_scores(false))
            .await;
        assert_eq!(response.results[0].score, None);
        assert_eq!(response.retrieved_content, "[Result 1]\nKnife skills.");

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["results"][0].get("score").is_none());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn filters_and_config_defaults_apply() {
        let embedder = AxisEmbedder::new();
        let store = store();
        let retriever = Retriever::new(&embedder, &store).with_config(RetrievalConfig {
            top_k: 1,
            ..Default::default()
        });

        let response = retriever.query(&QueryRequest::new("rust")).await;
        assert_eq!(response.result_count, 1);

        let response = retriever
            .query(&QueryRequest::new("cooking").with_filter("topic", "ai"))
            .await;
        let ids: Vec<_> = response.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1"]);
    }

    #[tokio::test]
    async fn repeated_queries_are_identical() {
        let embedder = AxisEmbedder::new();
        let store = store();
        let retriever = Retriever::new(&embedder, &store);
        let request = QueryRequest::new("rust");
        assert_eq!(retriever.query(&request).await, retriever.query(&request).await);
    }

    #[tokio::test]
    async fn search_errors_become_failed_responses() {
        let embedder = AxisEmbedder::new();
        let store = MemoryIndexStore::new(5);
        let response = Retriever::new(&embedder, &store).query(&QueryRequest::new("rust")).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("dimension"));
    }
}
