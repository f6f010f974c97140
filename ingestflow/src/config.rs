//! Orchestrator tuning knobs.

use std::time::Duration;

/// Configuration for the orchestrator's dispatch loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running stages within one job.
    pub max_concurrent_stages: usize,
    /// How long in-flight stages may keep running after a cancellation
    /// request before their ledger entries are failed.
    pub cancel_grace: Duration,
    /// How many times an optimistic context write is retried with fresh
    /// reads before the stage is failed fatally.
    pub context_write_retries: u32,
    /// Suspension before re-dispatching a stage whose attempt hit an
    /// unavailable storage backend.
    pub store_retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 4,
            cancel_grace: Duration::from_secs(5),
            context_write_retries: 3,
            store_retry_delay: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool bound.
    #[must_use]
    pub fn with_max_concurrent_stages(mut self, bound: usize) -> Self {
        self.max_concurrent_stages = bound.max(1);
        self
    }

    /// Sets the cancellation grace window.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Sets the context write retry bound.
    #[must_use]
    pub fn with_context_write_retries(mut self, retries: u32) -> Self {
        self.context_write_retries = retries;
        self
    }

    /// Sets the backend-outage re-dispatch delay.
    #[must_use]
    pub fn with_store_retry_delay(mut self, delay: Duration) -> Self {
        self.store_retry_delay = delay;
        self
    }
}
