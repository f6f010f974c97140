//! Job-scoped key-value context persistence with optimistic versioning.

use crate::core::ContextEntry;
use crate::errors::StoreError;
use crate::job::JobId;
use async_trait::async_trait;
use dashmap::DashMap;

/// Key-value persistence for cross-stage metadata, scoped per job.
///
/// Writes are last-writer-wins per key with a version guard: a write must
/// name the version it read (0 for an absent key) and fails with
/// [`StoreError::VersionConflict`] if another writer got there first.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Reads an entry, or `None` if the key is absent in the job's scope.
    async fn read(&self, job_id: JobId, key: &str) -> Result<Option<ContextEntry>, StoreError>;

    /// Writes a value, guarded by `expected_version`. Returns the new
    /// version on success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] when the stored version does
    /// not match `expected_version`.
    async fn write(
        &self,
        job_id: JobId,
        key: &str,
        value: serde_json::Value,
        written_by: &str,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Lists every entry in the job's scope.
    async fn entries(&self, job_id: JobId) -> Result<Vec<ContextEntry>, StoreError>;

    /// Tears down the job's scope when the job is archived.
    async fn remove_scope(&self, job_id: JobId) -> Result<(), StoreError>;
}

/// In-memory reference context store.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    entries: DashMap<(JobId, String), ContextEntry>,
}

impl InMemoryContextStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn read(&self, job_id: JobId, key: &str) -> Result<Option<ContextEntry>, StoreError> {
        Ok(self
            .entries
            .get(&(job_id, key.to_string()))
            .map(|e| e.clone()))
    }

    async fn write(
        &self,
        job_id: JobId,
        key: &str,
        value: serde_json::Value,
        written_by: &str,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let map_key = (job_id, key.to_string());
        match self.entries.entry(map_key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let current = slot.get().version;
                if current != expected_version {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected: expected_version,
                        actual: current,
                    });
                }
                let next = current + 1;
                slot.insert(ContextEntry {
                    job_id,
                    key: key.to_string(),
                    value,
                    written_by: written_by.to_string(),
                    version: next,
                });
                Ok(next)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected: expected_version,
                        actual: 0,
                    });
                }
                slot.insert(ContextEntry {
                    job_id,
                    key: key.to_string(),
                    value,
                    written_by: written_by.to_string(),
                    version: 1,
                });
                Ok(1)
            }
        }
    }

    async fn entries(&self, job_id: JobId) -> Result<Vec<ContextEntry>, StoreError> {
        let mut entries: Vec<ContextEntry> = self
            .entries
            .iter()
            .filter(|kv| kv.key().0 == job_id)
            .map(|kv| kv.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn remove_scope(&self, job_id: JobId) -> Result<(), StoreError> {
        self.entries.retain(|key, _| key.0 != job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn first_write_creates_version_one() {
        let store = InMemoryContextStore::new();
        let job_id = JobId::new();
        let version = store
            .write(job_id, "confidence", serde_json::json!(0.95), "normalize", 0)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let entry = store.read(job_id, "confidence").await.unwrap().unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.written_by, "normalize");
    }

    #[tokio::test]
    async fn versions_increment_on_overwrite() {
        let store = InMemoryContextStore::new();
        let job_id = JobId::new();
        store
            .write(job_id, "k", serde_json::json!(1), "a", 0)
            .await
            .unwrap();
        let version = store
            .write(job_id, "k", serde_json::json!(2), "a", 1)
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryContextStore::new();
        let job_id = JobId::new();
        store
            .write(job_id, "k", serde_json::json!(1), "a", 0)
            .await
            .unwrap();

        let err = store
            .write(job_id, "k", serde_json::json!(2), "b", 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn scopes_are_isolated_per_job() {
        let store = InMemoryContextStore::new();
        let first = JobId::new();
        let second = JobId::new();
        store
            .write(first, "k", serde_json::json!(1), "a", 0)
            .await
            .unwrap();

        assert!(store.read(second, "k").await.unwrap().is_none());
        assert_eq!(store.entries(second).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn remove_scope_tears_down_entries() {
        let store = InMemoryContextStore::new();
        let job_id = JobId::new();
        store
            .write(job_id, "k", serde_json::json!(1), "a", 0)
            .await
            .unwrap();
        store.remove_scope(job_id).await.unwrap();
        assert!(store.read(job_id, "k").await.unwrap().is_none());
    }
}
