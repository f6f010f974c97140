//! The orchestrator: drives jobs to a terminal status.
//!
//! Given a validated pipeline definition and an input artifact, the
//! orchestrator repeatedly selects ready stages, dispatches them on worker
//! tasks, persists produced artifacts and context writes, records every
//! transition in the execution ledger, and emits telemetry. All progress
//! decisions are derived from the ledger, which is what makes `run_job`
//! safe to re-invoke after a crash.

mod runner;

#[cfg(test)]
mod integration_tests;

use crate::cancellation::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::core::ArtifactId;
use crate::errors::IngestError;
use crate::job::{Job, JobId, JobReport, JobStatus};
use crate::ledger::{ExecutionLedger, LedgerEntry, StageState};
use crate::pipeline::PipelineDefinition;
use crate::stages::Stage;
use crate::store::{ArtifactStore, ContextStore};
use crate::telemetry::{NoOpTelemetrySink, TelemetrySink};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Maps stage types named by pipeline nodes to their implementations.
///
/// A closed registry instead of ad-hoc type inspection: a definition can only
/// reference stage types registered before submission.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage implementation under a type name.
    #[must_use]
    pub fn with_stage(mut self, stage_type: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage_type.into(), stage);
        self
    }

    /// Looks up an implementation.
    #[must_use]
    pub fn get(&self, stage_type: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(stage_type).cloned()
    }

    /// Returns true if the type is registered.
    #[must_use]
    pub fn contains(&self, stage_type: &str) -> bool {
        self.stages.contains_key(stage_type)
    }
}

/// Per-job bookkeeping held by the orchestrator.
pub(crate) struct JobSlot {
    pub(crate) job: parking_lot::RwLock<Job>,
    pub(crate) definition: Arc<PipelineDefinition>,
    pub(crate) cancel: CancellationToken,
}

/// The orchestration engine.
pub struct Orchestrator {
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) context: Arc<dyn ContextStore>,
    pub(crate) ledger: Arc<dyn ExecutionLedger>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) registry: StageRegistry,
    pub(crate) config: OrchestratorConfig,
    jobs: DashMap<JobId, Arc<JobSlot>>,
}

impl Orchestrator {
    /// Creates an orchestrator over the given backends and stage registry.
    #[must_use]
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        context: Arc<dyn ContextStore>,
        ledger: Arc<dyn ExecutionLedger>,
        registry: StageRegistry,
    ) -> Self {
        Self {
            artifacts,
            context,
            ledger,
            telemetry: Arc::new(NoOpTelemetrySink),
            registry,
            config: OrchestratorConfig::default(),
            jobs: DashMap::new(),
        }
    }

    /// Sets the telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Sets the dispatch configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Submits a job: validates the definition, checks the input artifact,
    /// and seeds the execution ledger. Nothing runs until [`Self::run_job`].
    ///
    /// # Errors
    ///
    /// Returns a [`crate::errors::GraphError`] for invalid definitions,
    /// `UnknownStageType` for unregistered stage types, and
    /// `InputArtifactMissing` if the input is not in the artifact store.
    pub async fn submit_job(
        &self,
        definition: PipelineDefinition,
        input_artifact_id: ArtifactId,
    ) -> Result<JobId, IngestError> {
        definition.validate()?;
        for node in definition.nodes() {
            if !self.registry.contains(&node.stage_type) {
                return Err(IngestError::UnknownStageType {
                    stage_id: node.stage_id.clone(),
                    stage_type: node.stage_type.clone(),
                });
            }
        }
        if !self.artifacts.exists(&input_artifact_id).await? {
            return Err(IngestError::InputArtifactMissing(input_artifact_id));
        }

        let job_id = JobId::new();
        for stage_id in definition.stage_ids() {
            self.ledger
                .create(job_id, LedgerEntry::not_started(stage_id))
                .await?;
        }

        let job = Job::new(job_id, definition.id(), input_artifact_id);
        self.jobs.insert(
            job_id,
            Arc::new(JobSlot {
                job: parking_lot::RwLock::new(job),
                definition: Arc::new(definition),
                cancel: CancellationToken::new(),
            }),
        );
        info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    /// Drives a job to a terminal status and returns its report.
    ///
    /// Re-invoking after a crash or a backend outage is safe: stale ledger
    /// entries are reset without charging the interrupted attempt, already
    /// succeeded stages are detected through the ledger and never re-run,
    /// and artifact re-production deduplicates by content hash.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::StoreError::Unavailable`] (wrapped) if a
    /// backend goes down mid-run; the job is left `Running` and can be
    /// resumed by calling `run_job` again.
    pub async fn run_job(&self, job_id: JobId) -> Result<JobReport, IngestError> {
        let slot = self.slot(job_id)?;

        let terminal = {
            let mut job = slot.job.write();
            if job.status.is_terminal() {
                true
            } else {
                job.status = JobStatus::Running;
                if job.started_at.is_none() {
                    job.started_at = Some(Utc::now());
                }
                false
            }
        };
        if terminal {
            return self.report(&slot).await;
        }

        self.recover_stale(job_id).await?;

        match self.drive(&slot).await {
            Ok(runner::DriveEnd::Completed) => {
                let states = self.ledger.entries(job_id).await?;
                let failed = states
                    .values()
                    .any(|e| e.state == StageState::FailedFatal);
                let status = if failed {
                    JobStatus::Failed
                } else {
                    JobStatus::Succeeded
                };
                self.finish(&slot, status);
            }
            Ok(runner::DriveEnd::Cancelled) => {
                self.finish(&slot, JobStatus::Cancelled);
            }
            Err(err) => {
                // Backend outages leave the job resumable; anything else is
                // a hard failure of the run itself.
                let resumable = matches!(
                    &err,
                    IngestError::Store(store_err) if store_err.is_unavailable()
                );
                if !resumable {
                    self.finish(&slot, JobStatus::Failed);
                }
                return Err(err);
            }
        }

        self.report(&slot).await
    }

    /// Returns the job's current status and per-stage states.
    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobReport, IngestError> {
        let slot = self.slot(job_id)?;
        self.report(&slot).await
    }

    /// Requests cooperative cancellation of a job.
    ///
    /// Stages already running are allowed to finish within the configured
    /// grace window; nothing new is dispatched after the signal.
    pub fn cancel_job(&self, job_id: JobId) -> Result<(), IngestError> {
        let slot = self.slot(job_id)?;
        {
            let mut job = slot.job.write();
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
            }
        }
        slot.cancel.cancel();
        info!(job_id = %job_id, "cancellation requested");
        Ok(())
    }

    /// Archives a terminal job: tears down its context scope and forgets it.
    ///
    /// Artifacts and ledger entries are retained; retention there is a store
    /// policy, not an orchestrator decision.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJobState` if the job is not terminal.
    pub async fn archive_job(&self, job_id: JobId) -> Result<(), IngestError> {
        let slot = self.slot(job_id)?;
        let status = slot.job.read().status;
        if !status.is_terminal() {
            return Err(IngestError::InvalidJobState {
                job_id,
                status: status.to_string(),
                expected: "a terminal status".into(),
            });
        }
        self.context.remove_scope(job_id).await?;
        self.jobs.remove(&job_id);
        info!(job_id = %job_id, "job archived");
        Ok(())
    }

    fn slot(&self, job_id: JobId) -> Result<Arc<JobSlot>, IngestError> {
        self.jobs
            .get(&job_id)
            .map(|slot| slot.clone())
            .ok_or(IngestError::JobNotFound(job_id))
    }

    fn finish(&self, slot: &JobSlot, status: JobStatus) {
        let mut job = slot.job.write();
        job.status = status;
        job.finished_at = Some(Utc::now());
        info!(job_id = %job.job_id, status = %status, "job finished");
    }

    async fn report(&self, slot: &JobSlot) -> Result<JobReport, IngestError> {
        let (job_id, status) = {
            let job = slot.job.read();
            (job.job_id, job.status)
        };
        let states = self.ledger.entries(job_id).await?;

        let mut stage_states = BTreeMap::new();
        let mut produced_artifacts = BTreeMap::new();
        for (stage_id, entry) in states {
            if !entry.produced_artifact_ids.is_empty() {
                produced_artifacts.insert(stage_id.clone(), entry.produced_artifact_ids.clone());
            }
            stage_states.insert(stage_id, entry.state);
        }

        Ok(JobReport {
            job_id,
            status,
            stage_states,
            produced_artifacts,
        })
    }
}
