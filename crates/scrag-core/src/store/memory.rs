//! In-memory vector store. Holds documents and their embeddings; supports
//! insert/update, delete and similarity search. No persistence of its own;
//! [`FileIndexStore`](super::FileIndexStore) builds on it.

use std::collections::HashMap;

use serde_json::Value;

use super::matrix::EmbeddingMatrix;
use super::{
    AddReport, IndexDocument, IndexStats, IndexStore, SearchQuery, SearchResult, SkippedDocument, StoreError,
};
use crate::Metadata;

/// Documents keyed by id, plus the embedding matrix whose rows follow `ids`.
///
/// `ids.len()`, the matrix row count and `documents.len()` are always equal; the
/// matrix is `None` exactly when the store is empty.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndexStore {
    dimension: usize,
    documents: HashMap<String, IndexDocument>,
    ids: Vec<String>,
    matrix: Option<EmbeddingMatrix>,
}

impl MemoryIndexStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in insertion (matrix row) order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Documents in insertion order.
    pub fn documents(&self) -> impl Iterator<Item = &IndexDocument> {
        self.ids.iter().filter_map(|id| self.documents.get(id))
    }

    /// Apply a batch without persisting. Never fails; bad documents are skipped.
    pub(crate) fn insert_documents(&mut self, documents: Vec<IndexDocument>) -> AddReport {
        let mut report = AddReport::default();
        for doc in documents {
            if let Some(reason) = self.rejection(&doc) {
                tracing::warn!(id = %doc.id, %reason, "skipping document");
                report.skipped.push(SkippedDocument { id: doc.id, reason });
                continue;
            }

            if self.documents.contains_key(&doc.id) {
                if let (Some(row), Some(matrix)) = (
                    self.ids.iter().position(|id| *id == doc.id),
                    self.matrix.as_mut(),
                ) {
                    matrix.set_row(row, &doc.embedding);
                }
                self.documents.insert(doc.id.clone(), doc);
                report.updated += 1;
            } else {
                self.matrix
                    .get_or_insert_with(|| EmbeddingMatrix::new(self.dimension))
                    .push_row(&doc.embedding);
                self.ids.push(doc.id.clone());
                self.documents.insert(doc.id.clone(), doc);
                report.added += 1;
            }
        }
        debug_assert!(self.is_consistent());
        report
    }

    /// Why `doc` cannot be stored, if it cannot.
    fn rejection(&self, doc: &IndexDocument) -> Option<String> {
        if doc.id.is_empty() {
            return Some("document id is empty".to_string());
        }
        if doc.embedding.is_empty() {
            return Some("embedding is empty".to_string());
        }
        if doc.embedding.len() != self.dimension {
            return Some(format!(
                "embedding dimension {} does not match index dimension {}",
                doc.embedding.len(),
                self.dimension
            ));
        }
        if doc.embedding.iter().any(|x| !x.is_finite()) {
            return Some("embedding contains non-finite values".to_string());
        }
        None
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let Some(row) = self.ids.iter().position(|i| i == id) else {
            return false;
        };
        self.ids.remove(row);
        self.documents.remove(id);
        if self.ids.is_empty() {
            self.matrix = None;
        } else if let Some(matrix) = self.matrix.as_mut() {
            matrix.remove_row(row);
        }
        debug_assert!(self.is_consistent());
        true
    }

    pub(crate) fn reset(&mut self) {
        self.documents.clear();
        self.ids.clear();
        self.matrix = None;
    }

    /// Rebuild the matrix from the documents, in id order.
    pub fn rebuild_matrix(&mut self) {
        if self.ids.is_empty() {
            self.matrix = None;
            return;
        }
        let mut matrix = EmbeddingMatrix::new(self.dimension);
        for doc in self.ids.iter().filter_map(|id| self.documents.get(id)) {
            matrix.push_row(&doc.embedding);
        }
        self.matrix = Some(matrix);
    }

    fn is_consistent(&self) -> bool {
        let rows = self.matrix.as_ref().map_or(0, EmbeddingMatrix::rows);
        self.ids.len() == self.documents.len()
            && rows == self.ids.len()
            && (self.matrix.is_some() || self.ids.is_empty())
    }
}

impl IndexStore for MemoryIndexStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn add_documents(&mut self, documents: Vec<IndexDocument>) -> Result<AddReport, StoreError> {
        Ok(self.insert_documents(documents))
    }

    /// Filters and threshold are applied before ranking, so `top_k` counts only
    /// qualifying documents. Equal scores keep insertion order.
    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, StoreError> {
        if query.embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: query.embedding.len(),
            });
        }
        let Some(matrix) = &self.matrix else {
            return Ok(Vec::new());
        };
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<(&IndexDocument, f32)> = matrix
            .cosine_similarities(&query.embedding)
            .into_iter()
            .zip(&self.ids)
            .filter(|(score, _)| *score >= query.threshold)
            .filter_map(|(score, id)| self.documents.get(id).map(|doc| (doc, score)))
            .filter(|(doc, _)| query.matches(&doc.metadata))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(query.top_k);

        tracing::debug!(
            candidates = self.ids.len(),
            returned = ranked.len(),
            top_k = query.top_k,
            threshold = query.threshold,
            "searched index"
        );

        Ok(ranked
            .into_iter()
            .map(|(doc, score)| {
                let mut metadata = Metadata::new();
                metadata.insert("similarity".into(), Value::from(score));
                SearchResult {
                    document: doc.clone(),
                    score,
                    metadata,
                }
            })
            .collect())
    }

    fn get_document(&self, id: &str) -> Option<&IndexDocument> {
        self.documents.get(id)
    }

    fn delete_document(&mut self, id: &str) -> Result<bool, StoreError> {
        Ok(self.remove(id))
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            total_documents: self.len(),
            embedding_dimension: self.dimension,
            index_path: None,
            index_size_bytes: 0,
        }
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str, embedding: Vec<f32>) -> IndexDocument {
        IndexDocument::new(id, format!("content of {id}"), embedding)
    }

    fn tagged(id: &str, embedding: Vec<f32>, topic: &str) -> IndexDocument {
        let mut meta = Metadata::new();
        meta.insert("topic".into(), json!(topic));
        doc(id, embedding).with_metadata(meta)
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.document.id.as_str()).collect()
    }

    #[test]
    fn search_ranks_and_applies_threshold() {
        let mut store = MemoryIndexStore::new(3);
        store
            .add_documents(vec![
                doc("doc1", vec![1.0, 0.0, 0.0]),
                doc("doc2", vec![0.0, 1.0, 0.0]),
                doc("doc3", vec![0.8, 0.0, 0.6]),
            ])
            .unwrap();

        let query = SearchQuery::new(vec![0.9, 0.1, 0.0]).with_top_k(2).with_threshold(0.5);
        let results = store.search(&query).unwrap();
        assert_eq!(ids(&results), vec!["doc1", "doc3"]);
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().all(|r| r.score >= 0.5));
        assert_eq!(results[0].metadata["similarity"], json!(results[0].score));
    }

    #[test]
    fn update_keeps_row_and_count() {
        let mut store = MemoryIndexStore::new(2);
        store
            .add_documents(vec![doc("a", vec![1.0, 0.0]), doc("b", vec![0.0, 1.0])])
            .unwrap();
        let report = store
            .add_documents(vec![IndexDocument::new("a", "new content", vec![0.0, 1.0])])
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.added, 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.ids(), &["a".to_string(), "b".to_string()]);

        let a = store.get_document("a").unwrap();
        assert_eq!(a.content, "new content");
        assert_eq!(a.embedding, vec![0.0, 1.0]);

        // Both rows now point the same way; the tie keeps insertion order.
        let results = store.search(&SearchQuery::new(vec![0.0, 1.0])).unwrap();
        assert_eq!(ids(&results), vec!["a", "b"]);
    }

    #[test]
    fn wrong_dimension_is_skipped_not_fatal() {
        let mut store = MemoryIndexStore::new(3);
        let report = store
            .add_documents(vec![
                doc("ok", vec![1.0, 0.0, 0.0]),
                doc("short", vec![1.0, 0.0]),
                doc("", vec![1.0, 0.0, 0.0]),
                doc("nan", vec![f32::NAN, 0.0, 0.0]),
            ])
            .unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(report.skipped[0].id, "short");
        assert_eq!(store.stats().total_documents, 1);
        assert!(store.get_document("short").is_none());
    }

    #[test]
    fn empty_embeddings_are_skipped_even_at_dimension_zero() {
        let mut store = MemoryIndexStore::new(0);
        let report = store.add_documents(vec![doc("a", vec![])]).unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, "embedding is empty");
        assert!(store.is_empty());
        assert!(store.is_consistent());
    }

    #[test]
    fn query_dimension_mismatch_is_an_error() {
        let store = MemoryIndexStore::new(3);
        assert!(matches!(
            store.search(&SearchQuery::new(vec![1.0])),
            Err(StoreError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn empty_store_and_zero_top_k_return_nothing() {
        let mut store = MemoryIndexStore::new(2);
        assert!(store.search(&SearchQuery::new(vec![1.0, 0.0])).unwrap().is_empty());
        store.add_documents(vec![doc("a", vec![1.0, 0.0])]).unwrap();
        assert!(store
            .search(&SearchQuery::new(vec![1.0, 0.0]).with_top_k(0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn filters_apply_before_top_k() {
        let mut store = MemoryIndexStore::new(2);
        store
            .add_documents(vec![
                tagged("best", vec![1.0, 0.0], "food"),
                tagged("good", vec![0.9, 0.1], "food"),
                tagged("fine", vec![0.7, 0.3], "ai"),
                tagged("meh", vec![0.5, 0.5], "ai"),
            ])
            .unwrap();

        let query = SearchQuery::new(vec![1.0, 0.0]).with_top_k(2).with_filter("topic", "ai");
        let results = store.search(&query).unwrap();
        assert_eq!(ids(&results), vec!["fine", "meh"]);
    }

    #[test]
    fn zero_vector_document_scores_zero() {
        let mut store = MemoryIndexStore::new(2);
        store
            .add_documents(vec![doc("zero", vec![0.0, 0.0]), doc("x", vec![1.0, 0.0])])
            .unwrap();
        let results = store
            .search(&SearchQuery::new(vec![1.0, 0.0]).with_threshold(-1.0))
            .unwrap();
        assert_eq!(ids(&results), vec!["x", "zero"]);
        assert_eq!(results[1].score, 0.0);
    }

    #[test]
    fn delete_last_document_drops_matrix() {
        let mut store = MemoryIndexStore::new(2);
        store
            .add_documents(vec![doc("a", vec![1.0, 0.0]), doc("b", vec![0.0, 1.0])])
            .unwrap();
        assert!(store.delete_document("a").unwrap());
        assert!(!store.delete_document("a").unwrap());
        assert_eq!(store.ids(), &["b".to_string()]);
        let results = store.search(&SearchQuery::new(vec![0.0, 1.0])).unwrap();
        assert_eq!(ids(&results), vec!["b"]);

        assert!(store.delete_document("b").unwrap());
        assert!(store.is_empty());
        assert!(store.matrix.is_none());
        assert!(store.search(&SearchQuery::new(vec![0.0, 1.0])).unwrap().is_empty());
    }

    #[test]
    fn rebuild_matrix_matches_incremental_state() {
        let mut store = MemoryIndexStore::new(2);
        store
            .add_documents(vec![doc("a", vec![1.0, 0.0]), doc("b", vec![0.0, 1.0])])
            .unwrap();
        store.delete_document("a").unwrap();
        store.add_documents(vec![doc("c", vec![0.6, 0.8])]).unwrap();
        let before = store.matrix.clone();
        store.rebuild_matrix();
        assert_eq!(store.matrix, before);
        assert_eq!(store.documents().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
