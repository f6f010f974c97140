//! Jobs: one ingestion run of one input through one pipeline definition.

use crate::core::ArtifactId;
use crate::ledger::StageState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh job id.
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal and non-terminal lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet driven.
    Pending,
    /// The dispatch loop is active (or paused on a backend outage).
    Running,
    /// All stages reached `Succeeded` or `Skipped` without a fatal failure.
    Succeeded,
    /// At least one stage ended `FailedFatal`.
    Failed,
    /// Cancellation was requested and the job wound down.
    Cancelled,
}

impl JobStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One ingestion run. Owns a context scope (keyed by `job_id`) and an
/// execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The job id.
    pub job_id: JobId,
    /// Id of the pipeline definition being executed.
    pub pipeline_id: String,
    /// The input artifact fed to root stages.
    pub input_artifact_id: ArtifactId,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// When the dispatch loop first started, if it has.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status, if it has.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job record.
    #[must_use]
    pub fn new(job_id: JobId, pipeline_id: impl Into<String>, input_artifact_id: ArtifactId) -> Self {
        Self {
            job_id,
            pipeline_id: pipeline_id.into(),
            input_artifact_id,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Snapshot of a job's status and per-stage outcomes.
///
/// Returned both from `run_job` (terminal) and `get_job_status` (possibly
/// mid-flight).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// The job id.
    pub job_id: JobId,
    /// Job status at snapshot time.
    pub status: JobStatus,
    /// Ledger state per stage.
    pub stage_states: BTreeMap<String, StageState>,
    /// Artifact ids produced per succeeded stage.
    pub produced_artifacts: BTreeMap<String, Vec<ArtifactId>>,
}

impl JobReport {
    /// Returns the ids of every artifact produced by the job, in stage order.
    #[must_use]
    pub fn all_artifacts(&self) -> Vec<&ArtifactId> {
        self.produced_artifacts.values().flatten().collect()
    }
}
