//! Immutable, content-addressed artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content hash identifying an artifact.
///
/// Two artifacts with identical bytes always share an id, which is what makes
/// stage re-execution after a crash safe: a duplicate write is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Computes the id for a content blob (SHA-256, hex encoded).
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(hex::encode(digest))
    }

    /// Wraps an already-computed hex digest.
    ///
    /// Used when re-reading ids from storage; no validation beyond ownership.
    #[must_use]
    pub fn from_hex(hex_digest: impl Into<String>) -> Self {
        Self(hex_digest.into())
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata envelope for a persisted artifact.
///
/// The content blob itself lives in the artifact store; stages only ever see
/// read-only copies. Artifacts are never deleted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Content hash of the blob.
    pub id: ArtifactId,
    /// Application-defined artifact kind (e.g. "transcript", "extraction").
    pub kind: String,
    /// Id of the stage that produced the artifact.
    pub produced_by: String,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Size of the content blob in bytes.
    pub size_bytes: u64,
}

impl Artifact {
    /// Builds the metadata envelope for a content blob.
    #[must_use]
    pub fn describe(kind: impl Into<String>, produced_by: impl Into<String>, content: &[u8]) -> Self {
        Self {
            id: ArtifactId::from_content(content),
            kind: kind.into(),
            produced_by: produced_by.into(),
            created_at: Utc::now(),
            size_bytes: content.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identical_content_hashes_identically() {
        let a = ArtifactId::from_content(b"hello");
        let b = ArtifactId::from_content(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_hashes_differently() {
        assert_ne!(
            ArtifactId::from_content(b"hello"),
            ArtifactId::from_content(b"world")
        );
    }

    #[test]
    fn id_is_hex_sha256() {
        let id = ArtifactId::from_content(b"");
        assert_eq!(
            id.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn describe_fills_envelope() {
        let artifact = Artifact::describe("transcript", "normalize", b"some text");
        assert_eq!(artifact.kind, "transcript");
        assert_eq!(artifact.produced_by, "normalize");
        assert_eq!(artifact.size_bytes, 9);
        assert_eq!(artifact.id, ArtifactId::from_content(b"some text"));
    }

    #[test]
    fn artifact_roundtrips_through_json() {
        let artifact = Artifact::describe("insight", "insight", b"{}");
        let json = serde_json::to_string(&artifact).unwrap();
        let back: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(artifact, back);
    }
}
