//! Error taxonomy for the ingestflow engine.
//!
//! Errors split into three families: [`GraphError`] for definition problems
//! rejected before any execution starts, [`StoreError`] for backend failures
//! surfaced by the capability traits, and [`IngestError`] as the top-level
//! error returned by the orchestrator's public API.

use crate::core::ArtifactId;
use crate::job::JobId;
use thiserror::Error;

/// The main error type for ingestflow operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The pipeline definition failed validation.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A storage backend failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The job id is not known to this orchestrator.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A stage node references a stage type with no registered implementation.
    #[error("stage '{stage_id}' references unregistered stage type '{stage_type}'")]
    UnknownStageType {
        /// The stage node id.
        stage_id: String,
        /// The unregistered stage type.
        stage_type: String,
    },

    /// The input artifact for a submitted job does not exist in the store.
    #[error("input artifact not found: {0}")]
    InputArtifactMissing(ArtifactId),

    /// The job is not in a state that allows the requested operation.
    #[error("job {job_id} is in state '{status}', expected {expected}")]
    InvalidJobState {
        /// The job id.
        job_id: JobId,
        /// The current status.
        status: String,
        /// Human-readable description of the expected state.
        expected: String,
    },

    /// The dispatch loop stalled with non-terminal stages and nothing running.
    ///
    /// Cannot happen for a definition that passed validation; kept as a
    /// defensive terminal error.
    #[error("job {job_id} deadlocked; remaining stages: {remaining:?}")]
    Deadlock {
        /// The job id.
        job_id: JobId,
        /// Stage ids that never reached a terminal state.
        remaining: Vec<String>,
    },

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error raised when a pipeline definition is structurally invalid.
///
/// Surfaced synchronously from `submit_job`, before any stage runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("cycle detected in pipeline: {}", path.join(" -> "))]
    CyclicGraph {
        /// The stage ids forming the cycle, first repeated last.
        path: Vec<String>,
    },

    /// A `depends_on` entry references a stage absent from the definition.
    #[error("stage '{stage_id}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The stage declaring the dependency.
        stage_id: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// Two stage nodes share the same id.
    #[error("duplicate stage id '{stage_id}' in pipeline definition")]
    DuplicateStage {
        /// The duplicated stage id.
        stage_id: String,
    },

    /// The definition contains no stages.
    #[error("pipeline definition has no stages")]
    EmptyDefinition,
}

/// Errors surfaced by the artifact, context, and ledger backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is temporarily unreachable.
    ///
    /// The orchestrator treats this as a pause, not a stage failure: progress
    /// decisions are ledger-derived and re-execution is idempotent, so the
    /// job stays `Running` and resumes once the backend recovers.
    #[error("{backend} store unavailable: {reason}")]
    Unavailable {
        /// The backend name (e.g. "artifact", "context", "ledger").
        backend: String,
        /// Failure detail.
        reason: String,
    },

    /// The requested record does not exist.
    #[error("not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// An optimistic context write lost a race.
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    VersionConflict {
        /// The context key.
        key: String,
        /// The version the writer expected.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// A stored record failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Creates an unavailable error for the given backend.
    #[must_use]
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Returns true if the error indicates a temporarily unreachable backend.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
