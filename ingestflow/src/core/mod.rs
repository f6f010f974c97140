//! Core data model: artifacts, context entries, and stage outcomes.

mod artifact;
mod context;
mod outcome;

pub use artifact::{Artifact, ArtifactId};
pub use context::{ContextEntry, ContextView, ContextWrite};
pub use outcome::{ArtifactPayload, ErrorKind, StageOutcome};
