//! Stage outcome variants and the error kinds recorded in the ledger.

use super::ContextWrite;
use serde::{Deserialize, Serialize};

/// A content blob produced by a stage, before it is persisted.
///
/// The orchestrator hashes the content and commits it to the artifact store;
/// stages never write to storage themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPayload {
    /// Application-defined artifact kind.
    pub kind: String,
    /// Raw content bytes.
    pub content: Vec<u8>,
}

impl ArtifactPayload {
    /// Creates a payload from raw bytes.
    #[must_use]
    pub fn new(kind: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }

    /// Creates a payload by serializing a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn json(kind: impl Into<String>, value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            content: serde_json::to_vec(value)?,
        })
    }
}

/// The closed result type of a stage execution.
///
/// Stages must be deterministic given identical inputs and context, so a
/// re-run of a `Produced` outcome yields byte-identical payloads and therefore
/// identical artifact ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage completed; artifacts and context writes are committed
    /// atomically with the ledger transition to `Succeeded`.
    Produced {
        /// Output artifacts (possibly empty, for filtering-only stages).
        artifacts: Vec<ArtifactPayload>,
        /// Context writes to apply under the stage's identity.
        context_writes: Vec<ContextWrite>,
    },
    /// A transient failure; eligible for retry under the node's policy.
    RetryableFailure {
        /// Failure detail.
        reason: String,
    },
    /// A non-retryable failure; propagates `Skipped` to dependents.
    FatalFailure {
        /// Failure detail.
        reason: String,
    },
}

impl StageOutcome {
    /// A successful outcome with no artifacts and no context writes.
    #[must_use]
    pub fn empty() -> Self {
        Self::Produced {
            artifacts: Vec::new(),
            context_writes: Vec::new(),
        }
    }

    /// A successful outcome with the given artifacts.
    #[must_use]
    pub fn produced(artifacts: Vec<ArtifactPayload>) -> Self {
        Self::Produced {
            artifacts,
            context_writes: Vec::new(),
        }
    }

    /// A transient failure.
    #[must_use]
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
        }
    }

    /// A non-retryable failure.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure {
            reason: reason.into(),
        }
    }

    /// Appends a context write to a `Produced` outcome; no-op on failures.
    #[must_use]
    pub fn with_context_write(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let Self::Produced { context_writes, .. } = &mut self {
            context_writes.push(ContextWrite::new(key, value));
        }
        self
    }

    /// Returns true for `Produced` outcomes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Produced { .. })
    }
}

/// Classification of a stage failure, recorded in the ledger and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error (I/O timeout, resource contention).
    Transient,
    /// Invalid input or contract violation; never retried.
    Fatal,
    /// The job was cancelled while the stage was in flight.
    Cancelled,
    /// The attempt was interrupted by a crash or restart; not charged
    /// against the retry budget.
    Interrupted,
    /// Optimistic context writes kept conflicting past the retry bound.
    VersionConflict,
    /// A storage backend was unreachable; the attempt is not charged.
    StoreUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::VersionConflict => "version_conflict",
            Self::StoreUnavailable => "store_unavailable",
        };
        f.write_str(name)
    }
}
