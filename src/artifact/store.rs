//! Content-addressed on-disk artifact store.
//!
//! Files are stored under their checksum (two-character fan-out directory,
//! then the full digest), so identical content is written once regardless of
//! how many artifacts reference it. Reads verify the checksum before
//! returning bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::job::ArtifactId;

use super::{compute_checksum, Artifact, Compression};

/// Errors raised by artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No artifact with the given id is registered.
    #[error("Artifact not found: {0}")]
    NotFound(ArtifactId),

    /// Stored bytes no longer match the recorded checksum.
    #[error("Checksum mismatch for artifact {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: ArtifactId,
        expected: String,
        actual: String,
    },
}

/// On-disk artifact store with an in-memory metadata index.
pub struct ArtifactStore {
    base_path: PathBuf,
    index: RwLock<HashMap<ArtifactId, Artifact>>,
}

impl ArtifactStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the store's root directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Stores an artifact, deduplicating by content.
    ///
    /// If a file with the same checksum already exists the bytes are not
    /// rewritten; only the metadata entry is added.
    pub async fn put(
        &self,
        name: impl Into<String>,
        data: &[u8],
        compression_hint: Compression,
    ) -> Result<Artifact, StoreError> {
        let checksum = compute_checksum(data);
        let path = self.content_path(&checksum);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&path).await? {
            tracing::debug!(checksum = %checksum, "Artifact content already present, skipping write");
        } else {
            let mut file = fs::File::create(&path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }

        let artifact = Artifact {
            id: ArtifactId::generate(),
            name: name.into(),
            size: data.len() as u64,
            checksum,
            compression_hint,
        };

        let mut index = self.index.write().expect("store index lock poisoned");
        index.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    /// Registers metadata for content that is already on disk.
    ///
    /// Used when rehydrating the index from a repository at startup.
    pub fn register(&self, artifact: Artifact) {
        let mut index = self.index.write().expect("store index lock poisoned");
        index.insert(artifact.id, artifact);
    }

    /// Reads an artifact's bytes, verifying the checksum.
    pub async fn read(&self, id: ArtifactId) -> Result<Vec<u8>, StoreError> {
        let artifact = self.metadata(id).ok_or(StoreError::NotFound(id))?;
        let data = fs::read(self.content_path(&artifact.checksum)).await?;

        let actual = compute_checksum(&data);
        if actual != artifact.checksum {
            return Err(StoreError::ChecksumMismatch {
                id,
                expected: artifact.checksum,
                actual,
            });
        }
        Ok(data)
    }

    /// Returns metadata for an artifact, if registered.
    pub fn metadata(&self, id: ArtifactId) -> Option<Artifact> {
        let index = self.index.read().expect("store index lock poisoned");
        index.get(&id).cloned()
    }

    /// Returns metadata for all registered artifacts.
    pub fn list(&self) -> Vec<Artifact> {
        let index = self.index.read().expect("store index lock poisoned");
        index.values().cloned().collect()
    }

    /// Returns whether an artifact id is registered.
    pub fn contains(&self, id: ArtifactId) -> bool {
        let index = self.index.read().expect("store index lock poisoned");
        index.contains_key(&id)
    }

    fn content_path(&self, checksum: &str) -> PathBuf {
        let fanout = &checksum[..2.min(checksum.len())];
        self.base_path.join(fanout).join(checksum)
    }
}
