//! Job-scoped context entries and the read view handed to stages.

use crate::cancellation::CancellationToken;
use crate::errors::StoreError;
use crate::job::JobId;
use crate::store::ContextStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A mutable key-value pair scoped to one job.
///
/// Last-writer-wins per key; `version` increments on every write so that
/// concurrent writers can detect conflicts optimistically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// The owning job.
    pub job_id: JobId,
    /// Context key.
    pub key: String,
    /// Stored value.
    pub value: serde_json::Value,
    /// Id of the stage that last wrote the entry.
    pub written_by: String,
    /// Monotonic version, starting at 1 for the first write.
    pub version: u64,
}

/// A pending context write declared by a stage outcome.
///
/// Writes are committed by the orchestrator after the stage succeeds, together
/// with the ledger transition, never by the stage itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWrite {
    /// Context key to write.
    pub key: String,
    /// Value to store.
    pub value: serde_json::Value,
}

impl ContextWrite {
    /// Creates a new context write.
    #[must_use]
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Read-only view of a job's context scope, as seen by one executing stage.
///
/// Visibility is limited to entries written by the stage's ancestors (and the
/// stage itself, on retry): a stage never observes a partial write from a
/// still-running peer because peers are, by construction, not ancestors.
pub struct ContextView {
    job_id: JobId,
    stage_id: String,
    visible_writers: HashSet<String>,
    store: Arc<dyn ContextStore>,
    cancel: CancellationToken,
}

impl ContextView {
    pub(crate) fn new(
        job_id: JobId,
        stage_id: impl Into<String>,
        visible_writers: HashSet<String>,
        store: Arc<dyn ContextStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            stage_id: stage_id.into(),
            visible_writers,
            store,
            cancel,
        }
    }

    /// The job this view is scoped to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The stage this view was built for.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Reads a context value, or `None` if absent or written by a
    /// non-ancestor stage.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    /// Reads a full context entry, applying the same visibility rule as
    /// [`ContextView::get`].
    pub async fn entry(&self, key: &str) -> Result<Option<ContextEntry>, StoreError> {
        let entry = self.store.read(self.job_id, key).await?;
        Ok(entry.filter(|e| self.visible_writers.contains(&e.written_by)))
    }

    /// Cooperative cancellation checkpoint for long-running stages.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ContextView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextView")
            .field("job_id", &self.job_id)
            .field("stage_id", &self.stage_id)
            .field("visible_writers", &self.visible_writers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryContextStore;

    async fn seeded_store(job_id: JobId) -> Arc<InMemoryContextStore> {
        let store = Arc::new(InMemoryContextStore::new());
        store
            .write(job_id, "confidence", serde_json::json!(0.95), "normalize", 0)
            .await
            .unwrap();
        store
            .write(job_id, "peer_key", serde_json::json!(true), "sibling", 0)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn reads_ancestor_entries() {
        let job_id = JobId::new();
        let store = seeded_store(job_id).await;
        let view = ContextView::new(
            job_id,
            "extract",
            ["normalize".to_string(), "extract".to_string()].into(),
            store,
            CancellationToken::new(),
        );

        let value = view.get("confidence").await.unwrap();
        assert_eq!(value, Some(serde_json::json!(0.95)));
    }

    #[tokio::test]
    async fn hides_entries_from_non_ancestors() {
        let job_id = JobId::new();
        let store = seeded_store(job_id).await;
        let view = ContextView::new(
            job_id,
            "extract",
            ["normalize".to_string(), "extract".to_string()].into(),
            store,
            CancellationToken::new(),
        );

        assert_eq!(view.get("peer_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let job_id = JobId::new();
        let store = seeded_store(job_id).await;
        let view = ContextView::new(
            job_id,
            "extract",
            HashSet::new(),
            store,
            CancellationToken::new(),
        );

        assert_eq!(view.get("absent").await.unwrap(), None);
    }
}
