//! Content-addressed artifact persistence.

use crate::core::{Artifact, ArtifactId};
use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressed persistence for raw and derived artifacts.
///
/// A duplicate put of identical content is a no-op returning the first
/// writer's metadata; the orchestrator relies on this for idempotent stage
/// re-execution. Artifacts are never deleted through this interface.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persists a content blob and returns its metadata envelope.
    async fn put(
        &self,
        kind: &str,
        produced_by: &str,
        content: &[u8],
    ) -> Result<Artifact, StoreError>;

    /// Reads a content blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is unknown.
    async fn get(&self, id: &ArtifactId) -> Result<Vec<u8>, StoreError>;

    /// Reads an artifact's metadata envelope.
    async fn metadata(&self, id: &ArtifactId) -> Result<Artifact, StoreError>;

    /// Returns true if the id is present.
    async fn exists(&self, id: &ArtifactId) -> Result<bool, StoreError>;
}

/// In-memory reference store.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    blobs: DashMap<ArtifactId, (Artifact, Vec<u8>)>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns true if no blobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        kind: &str,
        produced_by: &str,
        content: &[u8],
    ) -> Result<Artifact, StoreError> {
        let artifact = Artifact::describe(kind, produced_by, content);
        // First writer wins; identical content maps to the same id.
        let stored = self
            .blobs
            .entry(artifact.id.clone())
            .or_insert_with(|| (artifact, content.to_vec()));
        Ok(stored.0.clone())
    }

    async fn get(&self, id: &ArtifactId) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .get(id)
            .map(|kv| kv.1.clone())
            .ok_or_else(|| StoreError::not_found(id.to_string()))
    }

    async fn metadata(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        self.blobs
            .get(id)
            .map(|kv| kv.0.clone())
            .ok_or_else(|| StoreError::not_found(id.to_string()))
    }

    async fn exists(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(id))
    }
}

/// Filesystem store: one content file and one JSON metadata sidecar per
/// artifact, both named by the content hash. Append-only by construction.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn meta_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{}.json", id.as_str()))
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        kind: &str,
        produced_by: &str,
        content: &[u8],
    ) -> Result<Artifact, StoreError> {
        let artifact = Artifact::describe(kind, produced_by, content);
        let meta_path = self.meta_path(&artifact.id);

        // The metadata sidecar marks a committed write. If it exists the
        // blob was fully persisted before, and the duplicate put is a no-op.
        if tokio::fs::try_exists(&meta_path).await? {
            let raw = tokio::fs::read(&meta_path).await?;
            let stored: Artifact = serde_json::from_slice(&raw)?;
            debug!(artifact_id = %artifact.id, "deduplicated artifact write");
            return Ok(stored);
        }

        tokio::fs::write(self.blob_path(&artifact.id), content).await?;
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&artifact)?).await?;
        Ok(artifact)
    }

    async fn get(&self, id: &ArtifactId) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn metadata(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        match tokio::fs::read(self.meta_path(id)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.meta_path(id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = InMemoryArtifactStore::new();
        let artifact = store.put("transcript", "normalize", b"text").await.unwrap();
        assert_eq!(store.get(&artifact.id).await.unwrap(), b"text");
        assert!(store.exists(&artifact.id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_put_is_deduplicated() {
        let store = InMemoryArtifactStore::new();
        let first = store.put("transcript", "normalize", b"same").await.unwrap();
        let second = store.put("transcript", "replayed", b"same").await.unwrap();

        assert_eq!(first.id, second.id);
        // First writer wins, including metadata.
        assert_eq!(second.produced_by, "normalize");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let store = InMemoryArtifactStore::new();
        let id = ArtifactId::from_content(b"never stored");
        assert!(!store.exists(&id).await.unwrap());
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fs_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();

        let artifact = store.put("insight", "insight", b"{}").await.unwrap();
        assert_eq!(store.get(&artifact.id).await.unwrap(), b"{}");
        let meta = store.metadata(&artifact.id).await.unwrap();
        assert_eq!(meta, artifact);
    }

    #[tokio::test]
    async fn fs_store_deduplicates_and_keeps_first_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();

        let first = store.put("insight", "first", b"blob").await.unwrap();
        let second = store.put("insight", "second", b"blob").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.produced_by, "first");

        // One blob plus one sidecar on disk.
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn fs_store_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let id = ArtifactId::from_content(b"ghost");
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
