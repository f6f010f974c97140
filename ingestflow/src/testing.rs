//! Deterministic stage doubles and flaky store wrappers for tests and
//! examples.

use crate::core::{Artifact, ArtifactId, ArtifactPayload, ContextView, ContextWrite, StageOutcome};
use crate::errors::StoreError;
use crate::stages::{Stage, StageInput};
use crate::store::{ArtifactStore, InMemoryArtifactStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Returns a fixed outcome on every execution.
#[derive(Debug, Clone)]
pub struct StaticStage {
    payloads: Vec<ArtifactPayload>,
    writes: Vec<ContextWrite>,
}

impl StaticStage {
    /// A stage producing the given payloads.
    #[must_use]
    pub fn producing(payloads: Vec<ArtifactPayload>) -> Self {
        Self {
            payloads,
            writes: Vec::new(),
        }
    }

    /// A stage producing nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::producing(Vec::new())
    }

    /// Adds a context write to the outcome.
    #[must_use]
    pub fn with_write(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.writes.push(ContextWrite::new(key, value));
        self
    }
}

#[async_trait]
impl Stage for StaticStage {
    async fn execute(&self, _inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        StageOutcome::Produced {
            artifacts: self.payloads.clone(),
            context_writes: self.writes.clone(),
        }
    }
}

/// Concatenates the text of all inputs and appends a suffix.
///
/// Deterministic, so repeated executions produce byte-identical artifacts.
#[derive(Debug, Clone)]
pub struct AppendStage {
    suffix: String,
}

impl AppendStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

#[async_trait]
impl Stage for AppendStage {
    async fn execute(&self, inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let mut text = String::new();
        for input in inputs {
            text.push_str(&input.text());
        }
        text.push_str(&self.suffix);
        StageOutcome::produced(vec![ArtifactPayload::new("derived", text.into_bytes())])
    }
}

/// Fails with a retryable error a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FailNTimesStage {
    remaining: AtomicU32,
    reason: String,
}

impl FailNTimesStage {
    /// Creates a stage that fails `n` times before producing nothing.
    #[must_use]
    pub fn new(n: u32, reason: impl Into<String>) -> Self {
        Self {
            remaining: AtomicU32::new(n),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Stage for FailNTimesStage {
    async fn execute(&self, _inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            StageOutcome::retryable(self.reason.clone())
        } else {
            StageOutcome::empty()
        }
    }
}

/// Always fails with a retryable error.
#[derive(Debug, Clone)]
pub struct AlwaysRetryableStage {
    reason: String,
}

impl AlwaysRetryableStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Stage for AlwaysRetryableStage {
    async fn execute(&self, _inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        StageOutcome::retryable(self.reason.clone())
    }
}

/// Always fails fatally.
#[derive(Debug, Clone)]
pub struct AlwaysFatalStage {
    reason: String,
}

impl AlwaysFatalStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Stage for AlwaysFatalStage {
    async fn execute(&self, _inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        StageOutcome::fatal(self.reason.clone())
    }
}

/// Sleeps before producing nothing, polling the cancellation checkpoint.
#[derive(Debug, Clone)]
pub struct SlowStage {
    delay: Duration,
}

impl SlowStage {
    /// Creates a stage that sleeps for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Stage for SlowStage {
    async fn execute(&self, _inputs: &[StageInput], ctx: &ContextView) -> StageOutcome {
        tokio::time::sleep(self.delay).await;
        if ctx.cancel_requested() {
            return StageOutcome::retryable("cancelled at checkpoint");
        }
        StageOutcome::empty()
    }
}

/// Wraps an in-memory artifact store and fails the first `n` reads with
/// [`StoreError::Unavailable`], simulating a backend outage.
#[derive(Debug, Default)]
pub struct FlakyArtifactStore {
    inner: InMemoryArtifactStore,
    failing_reads: AtomicU32,
}

impl FlakyArtifactStore {
    /// Creates a store whose first `failing_reads` reads fail.
    #[must_use]
    pub fn new(failing_reads: u32) -> Self {
        Self {
            inner: InMemoryArtifactStore::new(),
            failing_reads: AtomicU32::new(failing_reads),
        }
    }

    fn outage(&self) -> Option<StoreError> {
        let remaining = self.failing_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_reads.store(remaining - 1, Ordering::SeqCst);
            Some(StoreError::unavailable("artifact", "simulated outage"))
        } else {
            None
        }
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifactStore {
    async fn put(
        &self,
        kind: &str,
        produced_by: &str,
        content: &[u8],
    ) -> Result<Artifact, StoreError> {
        self.inner.put(kind, produced_by, content).await
    }

    async fn get(&self, id: &ArtifactId) -> Result<Vec<u8>, StoreError> {
        if let Some(err) = self.outage() {
            return Err(err);
        }
        self.inner.get(id).await
    }

    async fn metadata(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        if let Some(err) = self.outage() {
            return Err(err);
        }
        self.inner.metadata(id).await
    }

    async fn exists(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        self.inner.exists(id).await
    }
}
