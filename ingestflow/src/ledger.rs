//! The execution ledger: durable source of truth for resumability.
//!
//! Every stage transition is a compare-and-set keyed on the stage's current
//! `(state, attempt)` pair, so two workers can never double-execute the same
//! ready stage under concurrent dispatch. On restart, readiness is
//! reconstructed purely from ledger entries plus the dependency graph.

use crate::core::{ArtifactId, ErrorKind};
use crate::errors::StoreError;
use crate::job::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Per-stage execution state.
///
/// `NotStarted → Ready → Running → {Succeeded | FailedRetryable | FailedFatal}`,
/// with `Ready → Skipped` when an ancestor fatally failed. `Succeeded`,
/// `FailedFatal` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet dispatched.
    NotStarted,
    /// Selected for dispatch; dependencies are satisfied.
    Ready,
    /// An attempt is in flight.
    Running,
    /// The stage completed; reached at most once per job.
    Succeeded,
    /// A transient failure; eligible for retry.
    FailedRetryable,
    /// A non-retryable failure, or the retry budget is exhausted.
    FailedFatal,
    /// An ancestor fatally failed; the stage was never (and will never be) run.
    Skipped,
}

impl StageState {
    /// Returns true for terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedFatal | Self::Skipped)
    }

    /// Returns true if the stage can be selected by the readiness computation.
    #[must_use]
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::NotStarted | Self::FailedRetryable)
    }

    /// Returns true if the state satisfies a downstream dependency.
    #[must_use]
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedFatal => "failed_fatal",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Durable record of one stage's execution within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The stage id.
    pub stage_id: String,
    /// Number of attempts charged so far.
    pub attempt: u32,
    /// Current state.
    pub state: StageState,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the latest attempt ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Artifacts committed by the successful attempt.
    pub produced_artifact_ids: Vec<ArtifactId>,
    /// Classification of the most recent failure, if any.
    pub error_kind: Option<ErrorKind>,
}

impl LedgerEntry {
    /// Creates the seed entry written at job submission.
    #[must_use]
    pub fn not_started(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            attempt: 0,
            state: StageState::NotStarted,
            started_at: None,
            ended_at: None,
            produced_artifact_ids: Vec::new(),
            error_kind: None,
        }
    }

    /// Returns a copy transitioned to a new state with `ended_at` stamped.
    #[must_use]
    pub fn ended(&self, state: StageState, error_kind: Option<ErrorKind>) -> Self {
        Self {
            state,
            ended_at: Some(Utc::now()),
            error_kind,
            ..self.clone()
        }
    }
}

/// Durable key-value persistence for ledger entries, with compare-and-set
/// transition semantics.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Reads one entry.
    async fn get(&self, job_id: JobId, stage_id: &str) -> Result<Option<LedgerEntry>, StoreError>;

    /// Reads every entry for a job, keyed by stage id.
    async fn entries(&self, job_id: JobId) -> Result<HashMap<String, LedgerEntry>, StoreError>;

    /// Inserts a seed entry. Returns false if the stage already has one.
    async fn create(&self, job_id: JobId, entry: LedgerEntry) -> Result<bool, StoreError>;

    /// Replaces the entry only if its current `(state, attempt)` matches
    /// `expected`. Returns false when the guard fails (a concurrent worker
    /// won the transition).
    async fn compare_and_set(
        &self,
        job_id: JobId,
        stage_id: &str,
        expected: (StageState, u32),
        next: LedgerEntry,
    ) -> Result<bool, StoreError>;
}

/// In-memory reference ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: DashMap<(JobId, String), LedgerEntry>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn get(&self, job_id: JobId, stage_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .entries
            .get(&(job_id, stage_id.to_string()))
            .map(|e| e.clone()))
    }

    async fn entries(&self, job_id: JobId) -> Result<HashMap<String, LedgerEntry>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|kv| kv.key().0 == job_id)
            .map(|kv| (kv.key().1.clone(), kv.value().clone()))
            .collect())
    }

    async fn create(&self, job_id: JobId, entry: LedgerEntry) -> Result<bool, StoreError> {
        let key = (job_id, entry.stage_id.clone());
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn compare_and_set(
        &self,
        job_id: JobId,
        stage_id: &str,
        expected: (StageState, u32),
        next: LedgerEntry,
    ) -> Result<bool, StoreError> {
        let key = (job_id, stage_id.to_string());
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let current = slot.get();
                if (current.state, current.attempt) == expected {
                    slot.insert(next);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Ok(false),
        }
    }
}
