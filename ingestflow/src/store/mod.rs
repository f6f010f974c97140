//! Storage capability traits and reference backends.

mod artifact;
mod context;

pub use artifact::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use context::{ContextStore, InMemoryContextStore};
