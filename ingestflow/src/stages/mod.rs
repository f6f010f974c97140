//! The stage contract: the polymorphic unit of transformation.

use crate::core::{Artifact, ContextView, StageOutcome};
use async_trait::async_trait;
use std::fmt::Debug;

/// One input artifact handed to a stage, metadata plus content.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// The artifact metadata envelope.
    pub artifact: Artifact,
    /// The content blob, read from the artifact store.
    pub content: Vec<u8>,
}

impl StageInput {
    /// Interprets the content as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Deserializes the content as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not valid JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }
}

/// A pluggable unit of transformation.
///
/// Inputs arrive in a deterministic order (dependency declaration order,
/// then production order within a dependency). Implementations must be
/// deterministic given identical inputs and context, which is what makes
/// re-execution after a crash idempotent. I/O-bound stages may block; they
/// should poll [`ContextView::cancel_requested`] at convenient checkpoints.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Executes the transformation.
    async fn execute(&self, inputs: &[StageInput], ctx: &ContextView) -> StageOutcome;
}

/// A stage backed by a plain function, for small transformations and tests.
pub struct FnStage<F>
where
    F: Fn(&[StageInput], &ContextView) -> StageOutcome + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&[StageInput], &ContextView) -> StageOutcome + Send + Sync,
{
    /// Creates a function-backed stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&[StageInput], &ContextView) -> StageOutcome + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&[StageInput], &ContextView) -> StageOutcome + Send + Sync,
{
    async fn execute(&self, inputs: &[StageInput], ctx: &ContextView) -> StageOutcome {
        (self.func)(inputs, ctx)
    }
}
