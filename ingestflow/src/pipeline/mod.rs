//! Pipeline definitions: the dependency graph of stages and their retry
//! policies.

mod definition;
mod retry;

pub use definition::{PipelineDefinition, StageNode};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
