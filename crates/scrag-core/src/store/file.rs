//! JSON-file index store. Every mutation rewrites the whole file through a
//! temporary sibling and a rename, so readers never see a half-written index.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::memory::MemoryIndexStore;
use super::{AddReport, IndexDocument, IndexStats, IndexStore, SearchQuery, SearchResult, StoreError};

/// On-disk layout. `stats` is written for humans and ignored on load.
#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default)]
    embedding_dimension: Option<usize>,
    #[serde(default)]
    documents: Vec<IndexDocument>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    embedding_dimension: usize,
    documents: Vec<&'a IndexDocument>,
    stats: FileStats<'a>,
}

#[derive(Serialize)]
struct FileStats<'a> {
    total_documents: usize,
    embedding_dimension: usize,
    index_path: &'a Path,
    /// Size of the file being replaced; 0 on first write.
    index_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FileIndexStore {
    inner: MemoryIndexStore,
    path: PathBuf,
    create_if_missing: bool,
}

impl FileIndexStore {
    /// Open the index at `path`. A missing or unreadable file gives an empty
    /// store; the error is logged and the file is replaced on the next write.
    /// When the file records a different dimension, the file wins.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Self {
        let path = path.into();
        let inner = match load(&path) {
            Ok(Some(file)) => restore(&path, file, dimension),
            Ok(None) => MemoryIndexStore::new(dimension),
            Err(e) => {
                tracing::warn!(error = %e, "starting with an empty index");
                MemoryIndexStore::new(dimension)
            }
        };
        Self {
            inner,
            path,
            create_if_missing: true,
        }
    }

    /// Whether the parent directory is created on save. Defaults to true.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn documents(&self) -> impl Iterator<Item = &IndexDocument> {
        self.inner.documents()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    /// Write the whole index atomically.
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.parent_dir() {
            if !dir.exists() {
                if !self.create_if_missing {
                    return Err(StoreError::MissingDirectory(dir.to_path_buf()));
                }
                fs::create_dir_all(dir).map_err(|e| StoreError::Write(dir.to_path_buf(), e))?;
            }
        }

        let dimension = self.inner.dimension();
        let file = IndexFileRef {
            embedding_dimension: dimension,
            documents: self.inner.documents().collect(),
            stats: FileStats {
                total_documents: self.inner.len(),
                embedding_dimension: dimension,
                index_path: &self.path,
                index_size_bytes: file_size(&self.path),
            },
        };

        let tmp = self.tmp_path();
        if let Err(e) = write_json(&tmp, &file) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Write(self.path.clone(), e));
        }
        tracing::debug!(path = %self.path.display(), documents = self.inner.len(), "saved index");
        Ok(())
    }

    /// Persist the current state, or roll memory back to `before` so it keeps
    /// matching the file.
    fn save_or_restore(&mut self, before: MemoryIndexStore) -> Result<(), StoreError> {
        if let Err(e) = self.save() {
            tracing::warn!(path = %self.path.display(), error = %e, "save failed; change rolled back");
            self.inner = before;
            return Err(e);
        }
        Ok(())
    }
}

fn load(path: &Path) -> Result<Option<IndexFile>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Read(path.to_path_buf(), e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::Corrupt(path.to_path_buf(), e))
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn restore(path: &Path, file: IndexFile, dimension: usize) -> MemoryIndexStore {
    // Files without a recorded dimension take it from their first document.
    let recorded = file
        .embedding_dimension
        .or_else(|| file.documents.first().map(|d| d.embedding.len()));
    let dimension = match recorded {
        Some(stored) if stored != dimension => {
            tracing::warn!(
                path = %path.display(),
                stored,
                requested = dimension,
                "index file dimension differs; using the stored dimension"
            );
            stored
        }
        _ => dimension,
    };

    let mut store = MemoryIndexStore::new(dimension);
    let report = store.insert_documents(file.documents);
    if !report.skipped.is_empty() {
        tracing::warn!(
            path = %path.display(),
            skipped = report.skipped.len(),
            "ignored invalid documents in index file"
        );
    }
    tracing::info!(path = %path.display(), documents = store.len(), dimension, "loaded index");
    store
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<(), StoreError> {
    let file = File::create(path).map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| StoreError::Write(path.to_path_buf(), e))
}

impl IndexStore for FileIndexStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_available(&self) -> bool {
        self.create_if_missing || self.parent_dir().map_or(true, Path::exists)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn add_documents(&mut self, documents: Vec<IndexDocument>) -> Result<AddReport, StoreError> {
        let before = self.inner.clone();
        let report = self.inner.insert_documents(documents);
        if report.indexed() > 0 {
            self.save_or_restore(before)?;
        }
        Ok(report)
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, StoreError> {
        self.inner.search(query)
    }

    fn get_document(&self, id: &str) -> Option<&IndexDocument> {
        self.inner.get_document(id)
    }

    fn delete_document(&mut self, id: &str) -> Result<bool, StoreError> {
        let before = self.inner.clone();
        if !self.inner.remove(id) {
            return Ok(false);
        }
        self.save_or_restore(before)?;
        Ok(true)
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            index_path: Some(self.path.clone()),
            index_size_bytes: file_size(&self.path),
            ..self.inner.stats()
        }
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.inner.reset();
        for path in [self.path.clone(), self.tmp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Remove(path, e)),
            }
        }
        tracing::info!(path = %self.path.display(), "cleared index");
        Ok(())
    }
}
