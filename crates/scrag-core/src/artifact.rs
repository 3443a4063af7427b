//! Chunks and their embeddings saved between the embed and index stages.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Metadata;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingArtifact {
    pub chunks: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl EmbeddingArtifact {
    pub fn new(chunks: Vec<String>, embeddings: Vec<Vec<f32>>, metadata: Metadata) -> Self {
        Self {
            chunks,
            embeddings,
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Every chunk must have exactly one embedding.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.chunks.len() != self.embeddings.len() {
            return Err(ArtifactError::LengthMismatch {
                chunks: self.chunks.len(),
                embeddings: self.embeddings.len(),
            });
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let raw = fs::read_to_string(path).map_err(|e| ArtifactError::Read(path.to_path_buf(), e))?;
        let artifact: Self =
            serde_json::from_str(&raw).map_err(|e| ArtifactError::Parse(path.to_path_buf(), e))?;
        artifact.validate()?;
        tracing::debug!(path = %path.display(), chunks = artifact.len(), "loaded embedding artifact");
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        self.validate()?;
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| ArtifactError::Write(dir.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(ArtifactError::Serialize)?;
        fs::write(path, json).map_err(|e| ArtifactError::Write(path.to_path_buf(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact has {chunks} chunks but {embeddings} embeddings")]
    LengthMismatch { chunks: usize, embeddings: usize },
    #[error("failed to read artifact {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("invalid artifact {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("failed to serialize artifact: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write artifact {0}: {1}")]
    Write(PathBuf, std::io::Error),
}
