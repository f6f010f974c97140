//! The dispatch loop.
//!
//! One iteration: propagate skips from fatal failures, recompute the ready
//! set from the ledger, dispatch up to the concurrency bound, then wait for
//! the next completion (or a backoff expiry, or cancellation). Every state
//! transition goes through the ledger's compare-and-set, so an attempt is
//! charged exactly once no matter how the loop is interleaved.

use super::{JobSlot, Orchestrator};
use crate::cancellation::CancellationToken;
use crate::core::{ArtifactId, ContextView, ContextWrite, ErrorKind, StageOutcome};
use crate::errors::{IngestError, StoreError};
use crate::job::JobId;
use crate::ledger::{LedgerEntry, StageState};
use crate::stages::{Stage, StageInput};
use crate::store::{ArtifactStore, ContextStore};
use crate::telemetry::TelemetryEvent;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a drive run ended.
pub(crate) enum DriveEnd {
    /// Every stage reached a terminal state.
    Completed,
    /// Cancellation was requested and in-flight work wound down.
    Cancelled,
}

/// What a spawned attempt reported back.
enum AttemptResult {
    /// The stage ran to an outcome.
    Outcome(StageOutcome),
    /// A storage backend was unreachable before or during the attempt; the
    /// attempt must not be charged.
    StoreDown { reason: String },
}

struct StageCompletion {
    stage_id: String,
    attempt: u32,
    result: AttemptResult,
}

/// Result of committing a successful outcome's context writes.
enum ContextCommit {
    Committed,
    Failed { kind: ErrorKind, reason: String },
    Unavailable { reason: String },
}

type AttemptStream = FuturesUnordered<BoxFuture<'static, StageCompletion>>;

impl Orchestrator {
    pub(crate) async fn drive(&self, slot: &Arc<JobSlot>) -> Result<DriveEnd, IngestError> {
        let (job_id, input_artifact_id) = {
            let job = slot.job.read();
            (job.job_id, job.input_artifact_id.clone())
        };

        let mut running: AttemptStream = FuturesUnordered::new();
        let mut in_flight: HashMap<String, AbortHandle> = HashMap::new();
        let mut backoffs: HashMap<String, Instant> = HashMap::new();

        loop {
            if slot.cancel.is_cancelled() {
                return self
                    .wind_down(slot, job_id, &mut running, &mut in_flight, &mut backoffs)
                    .await;
            }

            let mut states = self.ledger.entries(job_id).await?;
            self.propagate_skips(slot, job_id, &mut states).await?;

            if running.is_empty() && states.values().all(|e| e.state.is_terminal()) {
                return Ok(DriveEnd::Completed);
            }

            let now = Instant::now();
            backoffs.retain(|_, wake| *wake > now);

            for stage_id in slot.definition.ready_set(&states) {
                if running.len() >= self.config.max_concurrent_stages {
                    break;
                }
                if in_flight.contains_key(&stage_id) || backoffs.contains_key(&stage_id) {
                    continue;
                }
                let Some(current) = states.get(&stage_id) else {
                    continue;
                };
                let Some(entry) = self.begin_stage(job_id, current).await? else {
                    continue;
                };
                let (fut, abort) =
                    self.spawn_attempt(slot, job_id, &states, &stage_id, entry.attempt, &input_artifact_id)?;
                in_flight.insert(stage_id, abort);
                running.push(fut);
            }

            if running.is_empty() {
                // Nothing in flight: either wait out the earliest backoff or
                // report a stall. The latter cannot happen for a validated
                // definition.
                if let Some(wake) = backoffs.values().min().copied() {
                    tokio::select! {
                        () = slot.cancel.cancelled() => {}
                        () = tokio::time::sleep_until(wake) => {}
                    }
                    continue;
                }
                let remaining: Vec<String> = states
                    .values()
                    .filter(|e| !e.state.is_terminal())
                    .map(|e| e.stage_id.clone())
                    .collect();
                return Err(IngestError::Deadlock { job_id, remaining });
            }

            tokio::select! {
                () = slot.cancel.cancelled() => {}
                maybe = running.next() => {
                    if let Some(completion) = maybe {
                        in_flight.remove(&completion.stage_id);
                        self.reconcile(slot, job_id, completion, &mut backoffs).await?;
                    }
                }
            }
        }
    }

    /// Resets entries stranded by a previous crashed or interrupted run.
    ///
    /// A `Running` entry is returned to `NotStarted` with the interrupted
    /// attempt uncharged; a transient `Ready` entry just drops back.
    pub(crate) async fn recover_stale(&self, job_id: JobId) -> Result<(), IngestError> {
        let states = self.ledger.entries(job_id).await?;
        for entry in states.values() {
            let next = match entry.state {
                StageState::Running => {
                    let mut next = entry.ended(StageState::NotStarted, Some(ErrorKind::Interrupted));
                    next.attempt = entry.attempt.saturating_sub(1);
                    next
                }
                StageState::Ready => entry.ended(StageState::NotStarted, None),
                _ => continue,
            };
            if self
                .ledger
                .compare_and_set(job_id, &entry.stage_id, (entry.state, entry.attempt), next.clone())
                .await?
            {
                warn!(
                    job_id = %job_id,
                    stage_id = %entry.stage_id,
                    "reset stale ledger entry from interrupted run"
                );
                self.note_transition(job_id, &next);
            }
        }
        Ok(())
    }

    /// Claims a ready stage through a two-step compare-and-set and charges
    /// the next attempt. Returns `None` when a concurrent claimer won.
    async fn begin_stage(
        &self,
        job_id: JobId,
        current: &LedgerEntry,
    ) -> Result<Option<LedgerEntry>, IngestError> {
        let mut ready = current.clone();
        ready.state = StageState::Ready;
        if !self
            .ledger
            .compare_and_set(
                job_id,
                &current.stage_id,
                (current.state, current.attempt),
                ready.clone(),
            )
            .await?
        {
            return Ok(None);
        }

        let mut running = ready.clone();
        running.state = StageState::Running;
        running.attempt += 1;
        running.started_at = Some(Utc::now());
        running.ended_at = None;
        running.error_kind = None;
        running.produced_artifact_ids.clear();
        if !self
            .ledger
            .compare_and_set(
                job_id,
                &ready.stage_id,
                (StageState::Ready, ready.attempt),
                running.clone(),
            )
            .await?
        {
            return Ok(None);
        }

        debug!(
            job_id = %job_id,
            stage_id = %running.stage_id,
            attempt = running.attempt,
            "stage dispatched"
        );
        self.note_transition(job_id, &running);
        Ok(Some(running))
    }

    /// Spawns one attempt on a worker task and returns its completion future
    /// together with an abort handle.
    fn spawn_attempt(
        &self,
        slot: &Arc<JobSlot>,
        job_id: JobId,
        states: &HashMap<String, LedgerEntry>,
        stage_id: &str,
        attempt: u32,
        input_artifact_id: &ArtifactId,
    ) -> Result<(BoxFuture<'static, StageCompletion>, AbortHandle), IngestError> {
        let node = slot.definition.node(stage_id).ok_or_else(|| {
            IngestError::Internal(format!("stage '{stage_id}' missing from definition"))
        })?;
        let stage = self
            .registry
            .get(&node.stage_type)
            .ok_or_else(|| IngestError::UnknownStageType {
                stage_id: node.stage_id.clone(),
                stage_type: node.stage_type.clone(),
            })?;

        // Root stages receive the job input; everything else reads what its
        // dependencies produced, in dependency declaration order.
        let input_ids: Vec<ArtifactId> = if node.depends_on.is_empty() {
            vec![input_artifact_id.clone()]
        } else {
            node.depends_on
                .iter()
                .flat_map(|dep| {
                    states
                        .get(dep)
                        .map(|e| e.produced_artifact_ids.clone())
                        .unwrap_or_default()
                })
                .collect()
        };

        let mut visible_writers = slot.definition.ancestors(stage_id);
        visible_writers.insert(stage_id.to_string());

        let artifacts = Arc::clone(&self.artifacts);
        let context = Arc::clone(&self.context);
        let cancel = slot.cancel.clone();
        let stage_id = stage_id.to_string();
        let task_stage_id = stage_id.clone();

        let handle = tokio::spawn(async move {
            run_attempt(
                artifacts,
                context,
                cancel,
                job_id,
                task_stage_id,
                visible_writers,
                input_ids,
                stage,
            )
            .await
        });
        let abort = handle.abort_handle();

        let fut = async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    AttemptResult::Outcome(StageOutcome::fatal(format!("stage task failed: {err}")))
                }
            };
            StageCompletion {
                stage_id,
                attempt,
                result,
            }
        }
        .boxed();

        Ok((fut, abort))
    }

    /// Applies one attempt's result to the ledger: commits artifacts and
    /// context writes on success, schedules a retry or fails fatally on
    /// failure, releases the attempt on a backend outage.
    async fn reconcile(
        &self,
        slot: &Arc<JobSlot>,
        job_id: JobId,
        completion: StageCompletion,
        backoffs: &mut HashMap<String, Instant>,
    ) -> Result<(), IngestError> {
        let StageCompletion {
            stage_id,
            attempt,
            result,
        } = completion;
        let Some(current) = self.ledger.get(job_id, &stage_id).await? else {
            return Err(IngestError::Internal(format!(
                "no ledger entry for stage '{stage_id}'"
            )));
        };
        if (current.state, current.attempt) != (StageState::Running, attempt) {
            // The entry moved underneath us (e.g. failed by a cancellation
            // wind-down); the completion is stale.
            debug!(job_id = %job_id, stage_id = %stage_id, "dropping stale completion");
            return Ok(());
        }

        match result {
            AttemptResult::StoreDown { reason } => {
                self.release_attempt(job_id, &current, &reason, backoffs).await
            }
            AttemptResult::Outcome(StageOutcome::Produced {
                artifacts,
                context_writes,
            }) => {
                let mut produced = Vec::with_capacity(artifacts.len());
                for payload in &artifacts {
                    match self
                        .artifacts
                        .put(&payload.kind, &stage_id, &payload.content)
                        .await
                    {
                        Ok(artifact) => produced.push(artifact.id),
                        Err(err) if err.is_unavailable() => {
                            return self
                                .release_attempt(job_id, &current, &err.to_string(), backoffs)
                                .await;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }

                match self
                    .commit_context_writes(job_id, &stage_id, slot, context_writes)
                    .await?
                {
                    ContextCommit::Committed => {
                        let mut next = current.ended(StageState::Succeeded, None);
                        next.produced_artifact_ids = produced;
                        self.settle(job_id, &current, next).await
                    }
                    ContextCommit::Failed { kind, reason } => {
                        warn!(job_id = %job_id, stage_id = %stage_id, reason = %reason, "context commit failed");
                        let next = current.ended(StageState::FailedFatal, Some(kind));
                        self.settle(job_id, &current, next).await
                    }
                    ContextCommit::Unavailable { reason } => {
                        self.release_attempt(job_id, &current, &reason, backoffs).await
                    }
                }
            }
            AttemptResult::Outcome(StageOutcome::RetryableFailure { reason }) => {
                let policy = slot
                    .definition
                    .node(&stage_id)
                    .map(|n| n.retry.clone())
                    .unwrap_or_default();
                if policy.allows_retry(attempt) {
                    debug!(
                        job_id = %job_id,
                        stage_id = %stage_id,
                        attempt,
                        reason = %reason,
                        "retryable failure, backing off"
                    );
                    let next = current.ended(StageState::FailedRetryable, Some(ErrorKind::Transient));
                    self.settle(job_id, &current, next).await?;
                    backoffs.insert(stage_id, Instant::now() + policy.delay_for(attempt));
                    Ok(())
                } else {
                    warn!(
                        job_id = %job_id,
                        stage_id = %stage_id,
                        attempt,
                        reason = %reason,
                        "retry budget exhausted"
                    );
                    let next = current.ended(StageState::FailedFatal, Some(ErrorKind::Transient));
                    self.settle(job_id, &current, next).await
                }
            }
            AttemptResult::Outcome(StageOutcome::FatalFailure { reason }) => {
                warn!(job_id = %job_id, stage_id = %stage_id, reason = %reason, "fatal stage failure");
                let next = current.ended(StageState::FailedFatal, Some(ErrorKind::Fatal));
                self.settle(job_id, &current, next).await
            }
        }
    }

    /// Commits context writes declared by a successful outcome, with bounded
    /// optimistic retries on version conflicts.
    ///
    /// A stage may create keys and overwrite keys owned by itself or an
    /// ancestor; overwriting a non-ancestor's key fails the stage.
    async fn commit_context_writes(
        &self,
        job_id: JobId,
        stage_id: &str,
        slot: &Arc<JobSlot>,
        writes: Vec<ContextWrite>,
    ) -> Result<ContextCommit, IngestError> {
        if writes.is_empty() {
            return Ok(ContextCommit::Committed);
        }
        let mut allowed = slot.definition.ancestors(stage_id);
        allowed.insert(stage_id.to_string());

        for write in writes {
            let mut conflicts = 0;
            loop {
                let existing = match self.context.read(job_id, &write.key).await {
                    Ok(existing) => existing,
                    Err(err) if err.is_unavailable() => {
                        return Ok(ContextCommit::Unavailable {
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => return Err(err.into()),
                };
                if let Some(entry) = &existing {
                    if !allowed.contains(&entry.written_by) {
                        return Ok(ContextCommit::Failed {
                            kind: ErrorKind::Fatal,
                            reason: format!(
                                "context key '{}' is owned by non-ancestor stage '{}'",
                                write.key, entry.written_by
                            ),
                        });
                    }
                }
                let expected = existing.map_or(0, |e| e.version);

                match self
                    .context
                    .write(job_id, &write.key, write.value.clone(), stage_id, expected)
                    .await
                {
                    Ok(_) => break,
                    Err(StoreError::VersionConflict { .. }) => {
                        conflicts += 1;
                        if conflicts > self.config.context_write_retries {
                            return Ok(ContextCommit::Failed {
                                kind: ErrorKind::VersionConflict,
                                reason: format!(
                                    "context write on '{}' kept conflicting after {} retries",
                                    write.key, self.config.context_write_retries
                                ),
                            });
                        }
                    }
                    Err(err) if err.is_unavailable() => {
                        return Ok(ContextCommit::Unavailable {
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(ContextCommit::Committed)
    }

    /// Returns a `Running` entry to `NotStarted` without charging the attempt
    /// and schedules a re-dispatch after the configured outage delay.
    async fn release_attempt(
        &self,
        job_id: JobId,
        current: &LedgerEntry,
        reason: &str,
        backoffs: &mut HashMap<String, Instant>,
    ) -> Result<(), IngestError> {
        warn!(
            job_id = %job_id,
            stage_id = %current.stage_id,
            reason = %reason,
            "storage backend unavailable, releasing attempt"
        );
        let mut next = current.ended(StageState::NotStarted, Some(ErrorKind::StoreUnavailable));
        next.attempt = current.attempt.saturating_sub(1);
        self.settle(job_id, current, next).await?;
        backoffs.insert(
            current.stage_id.clone(),
            Instant::now() + self.config.store_retry_delay,
        );
        Ok(())
    }

    /// Marks dependents of fatally failed stages as `Skipped`.
    ///
    /// Runs at the top of every loop iteration so a fatal failure blocks its
    /// whole downstream cone before the next readiness computation.
    async fn propagate_skips(
        &self,
        slot: &Arc<JobSlot>,
        job_id: JobId,
        states: &mut HashMap<String, LedgerEntry>,
    ) -> Result<(), IngestError> {
        let mut to_skip: HashSet<String> = HashSet::new();
        for entry in states.values() {
            if entry.state == StageState::FailedFatal {
                to_skip.extend(slot.definition.transitive_dependents(&entry.stage_id));
            }
        }

        for stage_id in to_skip {
            let Some(entry) = states.get(&stage_id) else {
                continue;
            };
            if !entry.state.is_dispatchable() {
                continue;
            }
            let next = entry.ended(StageState::Skipped, None);
            if self
                .ledger
                .compare_and_set(job_id, &stage_id, (entry.state, entry.attempt), next.clone())
                .await?
            {
                debug!(job_id = %job_id, stage_id = %stage_id, "skipping dependent of fatal failure");
                self.note_transition(job_id, &next);
                states.insert(stage_id, next);
            }
        }
        Ok(())
    }

    /// Waits out the cancellation grace window, then fails whatever is still
    /// in flight. Stages that finish inside the window settle normally;
    /// stages never dispatched stay `NotStarted`.
    async fn wind_down(
        &self,
        slot: &Arc<JobSlot>,
        job_id: JobId,
        running: &mut AttemptStream,
        in_flight: &mut HashMap<String, AbortHandle>,
        backoffs: &mut HashMap<String, Instant>,
    ) -> Result<DriveEnd, IngestError> {
        let deadline = Instant::now() + self.config.cancel_grace;
        while !running.is_empty() {
            tokio::select! {
                maybe = running.next() => {
                    if let Some(completion) = maybe {
                        in_flight.remove(&completion.stage_id);
                        self.reconcile(slot, job_id, completion, backoffs).await?;
                    }
                }
                () = tokio::time::sleep_until(deadline) => break,
            }
        }
        for (_, abort) in in_flight.drain() {
            abort.abort();
        }

        let states = self.ledger.entries(job_id).await?;
        for entry in states.values() {
            if matches!(entry.state, StageState::Running | StageState::Ready) {
                let next = entry.ended(StageState::FailedFatal, Some(ErrorKind::Cancelled));
                if self
                    .ledger
                    .compare_and_set(job_id, &entry.stage_id, (entry.state, entry.attempt), next.clone())
                    .await?
                {
                    warn!(
                        job_id = %job_id,
                        stage_id = %entry.stage_id,
                        "stage exceeded cancellation grace window"
                    );
                    self.note_transition(job_id, &next);
                }
            }
        }
        Ok(DriveEnd::Cancelled)
    }

    /// Applies a transition guarded on the completion's `(Running, attempt)`
    /// snapshot and emits telemetry for it.
    async fn settle(
        &self,
        job_id: JobId,
        current: &LedgerEntry,
        next: LedgerEntry,
    ) -> Result<(), IngestError> {
        if self
            .ledger
            .compare_and_set(
                job_id,
                &current.stage_id,
                (current.state, current.attempt),
                next.clone(),
            )
            .await?
        {
            self.note_transition(job_id, &next);
        } else {
            warn!(
                job_id = %job_id,
                stage_id = %current.stage_id,
                "lost transition race, entry moved concurrently"
            );
        }
        Ok(())
    }

    fn note_transition(&self, job_id: JobId, entry: &LedgerEntry) {
        let mut event = TelemetryEvent::new(job_id, entry.stage_id.clone(), entry.state, entry.attempt);
        if let Some(kind) = entry.error_kind {
            event = event.with_error_kind(kind);
        }
        self.telemetry.emit(event);
    }
}

/// The body of one spawned attempt: load inputs, build the context view, run
/// the stage. Store outages surface as `StoreDown` so the attempt is not
/// charged; a missing input is a contract violation and fails fatally.
#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    artifacts: Arc<dyn ArtifactStore>,
    context: Arc<dyn ContextStore>,
    cancel: CancellationToken,
    job_id: JobId,
    stage_id: String,
    visible_writers: HashSet<String>,
    input_ids: Vec<ArtifactId>,
    stage: Arc<dyn Stage>,
) -> AttemptResult {
    let mut inputs = Vec::with_capacity(input_ids.len());
    for id in &input_ids {
        let metadata = match artifacts.metadata(id).await {
            Ok(metadata) => metadata,
            Err(err) if err.is_unavailable() => {
                return AttemptResult::StoreDown {
                    reason: err.to_string(),
                };
            }
            Err(err) => {
                return AttemptResult::Outcome(StageOutcome::fatal(format!(
                    "failed to load input artifact {id}: {err}"
                )));
            }
        };
        let content = match artifacts.get(id).await {
            Ok(content) => content,
            Err(err) if err.is_unavailable() => {
                return AttemptResult::StoreDown {
                    reason: err.to_string(),
                };
            }
            Err(err) => {
                return AttemptResult::Outcome(StageOutcome::fatal(format!(
                    "failed to load input artifact {id}: {err}"
                )));
            }
        };
        inputs.push(StageInput {
            artifact: metadata,
            content,
        });
    }

    let view = ContextView::new(job_id, stage_id, visible_writers, context, cancel);
    AttemptResult::Outcome(stage.execute(&inputs, &view).await)
}
