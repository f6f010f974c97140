//! End-to-end orchestrator tests over the in-memory backends.

use super::{Orchestrator, StageRegistry};
use crate::config::OrchestratorConfig;
use crate::core::{ArtifactId, ArtifactPayload, ContextView, ErrorKind, StageOutcome};
use crate::errors::{GraphError, IngestError};
use crate::job::JobStatus;
use crate::ledger::{ExecutionLedger, InMemoryLedger, StageState};
use crate::pipeline::{PipelineDefinition, RetryPolicy, StageNode};
use crate::stages::{Stage, StageInput};
use crate::store::{ArtifactStore, ContextStore, InMemoryArtifactStore, InMemoryContextStore};
use crate::telemetry::CollectingTelemetrySink;
use crate::testing::{
    AlwaysFatalStage, AlwaysRetryableStage, AppendStage, FailNTimesStage, FlakyArtifactStore,
    SlowStage, StaticStage,
};
use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    artifacts: Arc<InMemoryArtifactStore>,
    context: Arc<InMemoryContextStore>,
    ledger: Arc<InMemoryLedger>,
    sink: Arc<CollectingTelemetrySink>,
}

fn harness(registry: StageRegistry) -> Harness {
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let context = Arc::new(InMemoryContextStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let sink = Arc::new(CollectingTelemetrySink::new());
    let orchestrator = Arc::new(
        Orchestrator::new(
            artifacts.clone(),
            context.clone(),
            ledger.clone(),
            registry,
        )
        .with_telemetry(sink.clone())
        .with_config(
            OrchestratorConfig::new()
                .with_store_retry_delay(Duration::from_millis(10))
                .with_cancel_grace(Duration::from_secs(2)),
        ),
    );
    Harness {
        orchestrator,
        artifacts,
        context,
        ledger,
        sink,
    }
}

impl Harness {
    async fn seed_input(&self) -> ArtifactId {
        self.artifacts
            .put("transcript", "source", b"meeting notes")
            .await
            .unwrap()
            .id
    }
}

fn append_registry() -> StageRegistry {
    StageRegistry::new()
        .with_stage("a", Arc::new(AppendStage::new("|a")))
        .with_stage("b", Arc::new(AppendStage::new("|b")))
        .with_stage("c", Arc::new(AppendStage::new("|c")))
        .with_stage("d", Arc::new(AppendStage::new("|d")))
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(5)
}

fn diamond() -> PipelineDefinition {
    PipelineDefinition::new("diamond")
        .with_stage(StageNode::new("a", "a"))
        .with_stage(StageNode::new("b", "b").with_dependency("a"))
        .with_stage(StageNode::new("c", "c").with_dependency("a"))
        .with_stage(StageNode::new("d", "d").with_dependencies(["b", "c"]))
}

#[tokio::test]
async fn diamond_runs_to_success() {
    let h = harness(append_registry());
    let input = h.seed_input().await;

    let job_id = h.orchestrator.submit_job(diamond(), input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Succeeded);
    for stage in ["a", "b", "c", "d"] {
        assert_eq!(report.stage_states[stage], StageState::Succeeded);
    }

    // d concatenates b then c (dependency order), each derived from a.
    let d_ids = &report.produced_artifacts["d"];
    assert_eq!(d_ids.len(), 1);
    let content = h.artifacts.get(&d_ids[0]).await.unwrap();
    assert_eq!(
        String::from_utf8(content).unwrap(),
        "meeting notes|a|bmeeting notes|a|c|d"
    );
}

#[tokio::test]
async fn dependents_start_after_dependencies_end() {
    let h = harness(append_registry());
    let input = h.seed_input().await;
    let job_id = h.orchestrator.submit_job(diamond(), input).await.unwrap();
    h.orchestrator.run_job(job_id).await.unwrap();

    let a = h.ledger.get(job_id, "a").await.unwrap().unwrap();
    for dependent in ["b", "c"] {
        let entry = h.ledger.get(job_id, dependent).await.unwrap().unwrap();
        assert!(entry.started_at.unwrap() >= a.ended_at.unwrap());
    }
}

#[tokio::test]
async fn telemetry_records_running_then_succeeded() {
    let h = harness(append_registry());
    let input = h.seed_input().await;
    let job_id = h.orchestrator.submit_job(diamond(), input).await.unwrap();
    h.orchestrator.run_job(job_id).await.unwrap();

    let for_a = h.sink.events_for("a");
    assert_eq!(for_a.len(), 2);
    assert_eq!(for_a[0].state, StageState::Running);
    assert_eq!(for_a[1].state, StageState::Succeeded);
    assert_eq!(for_a[1].attempt, 1);
}

#[tokio::test]
async fn transient_failure_is_retried_then_succeeds() {
    let registry = StageRegistry::new()
        .with_stage("a", Arc::new(AppendStage::new("|a")))
        .with_stage("flaky", Arc::new(FailNTimesStage::new(1, "timeout")));
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("retrying")
        .with_stage(StageNode::new("a", "a"))
        .with_stage(
            StageNode::new("b", "flaky")
                .with_dependency("a")
                .with_retry(fast_retry(3)),
        );
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Succeeded);
    let entry = h.ledger.get(job_id, "b").await.unwrap().unwrap();
    assert_eq!(entry.attempt, 2);

    let states: Vec<StageState> = h.sink.events_for("b").iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            StageState::Running,
            StageState::FailedRetryable,
            StageState::Running,
            StageState::Succeeded
        ]
    );
}

#[tokio::test]
async fn exhausted_retries_fail_fatally_and_skip_dependents() {
    let registry = append_registry().with_stage("broken", Arc::new(AlwaysRetryableStage::new("timeout")));
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("diamond")
        .with_stage(StageNode::new("a", "a"))
        .with_stage(
            StageNode::new("b", "broken")
                .with_dependency("a")
                .with_retry(fast_retry(2)),
        )
        .with_stage(StageNode::new("c", "c").with_dependency("a"))
        .with_stage(StageNode::new("d", "d").with_dependencies(["b", "c"]));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.stage_states["b"], StageState::FailedFatal);
    assert_eq!(report.stage_states["c"], StageState::Succeeded);
    assert_eq!(report.stage_states["d"], StageState::Skipped);

    let b = h.ledger.get(job_id, "b").await.unwrap().unwrap();
    assert_eq!(b.attempt, 2);
    assert_eq!(b.error_kind, Some(ErrorKind::Transient));
}

#[tokio::test]
async fn fatal_failure_skips_the_downstream_cone() {
    let registry = append_registry().with_stage("bad", Arc::new(AlwaysFatalStage::new("bad input")));
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("chain")
        .with_stage(StageNode::new("a", "bad"))
        .with_stage(StageNode::new("b", "b").with_dependency("a"))
        .with_stage(StageNode::new("c", "c").with_dependency("b"));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.stage_states["a"], StageState::FailedFatal);
    assert_eq!(report.stage_states["b"], StageState::Skipped);
    assert_eq!(report.stage_states["c"], StageState::Skipped);
    assert!(report.produced_artifacts.is_empty());
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_leaves_pending_stages_untouched() {
    let registry = append_registry().with_stage("slow", Arc::new(SlowStage::new(Duration::from_millis(200))));
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("diamond")
        .with_stage(StageNode::new("a", "slow"))
        .with_stage(StageNode::new("b", "b").with_dependency("a"))
        .with_stage(StageNode::new("c", "c").with_dependency("a"))
        .with_stage(StageNode::new("d", "d").with_dependencies(["b", "c"]));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();

    let runner = h.orchestrator.clone();
    let handle = tokio::spawn(async move { runner.run_job(job_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orchestrator.cancel_job(job_id).unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    for stage in ["b", "c", "d"] {
        assert_eq!(report.stage_states[stage], StageState::NotStarted);
    }
    assert_ne!(report.stage_states["a"], StageState::Succeeded);
}

#[tokio::test]
async fn grace_window_expiry_fails_the_running_stage() {
    let registry = StageRegistry::new()
        .with_stage("stuck", Arc::new(SlowStage::new(Duration::from_secs(30))));
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let orchestrator = Arc::new(
        Orchestrator::new(
            artifacts.clone(),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(InMemoryLedger::new()),
            registry,
        )
        .with_config(OrchestratorConfig::new().with_cancel_grace(Duration::from_millis(50))),
    );
    let input = artifacts.put("transcript", "source", b"x").await.unwrap().id;

    let def = PipelineDefinition::new("stuck").with_stage(StageNode::new("a", "stuck"));
    let job_id = orchestrator.submit_job(def, input).await.unwrap();

    let runner = orchestrator.clone();
    let handle = tokio::spawn(async move { runner.run_job(job_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel_job(job_id).unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.stage_states["a"], StageState::FailedFatal);
}

#[tokio::test]
async fn cancelling_a_pending_job_is_immediate() {
    let h = harness(append_registry());
    let input = h.seed_input().await;
    let job_id = h.orchestrator.submit_job(diamond(), input).await.unwrap();

    h.orchestrator.cancel_job(job_id).unwrap();
    let report = h.orchestrator.get_job_status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);

    // A later run_job is a no-op returning the terminal report.
    let report = h.orchestrator.run_job(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.stage_states["a"], StageState::NotStarted);
}

#[tokio::test]
async fn resuming_after_a_crash_reproduces_identical_artifacts() {
    let h = harness(append_registry());
    let input = h.seed_input().await;

    let baseline_job = h.orchestrator.submit_job(diamond(), input.clone()).await.unwrap();
    let baseline = h.orchestrator.run_job(baseline_job).await.unwrap();

    // Simulate a crash mid-attempt: the ledger says "a" is running, but no
    // worker exists anymore.
    let crashed_job = h.orchestrator.submit_job(diamond(), input).await.unwrap();
    let seed = h.ledger.get(crashed_job, "a").await.unwrap().unwrap();
    let mut stale = seed.clone();
    stale.state = StageState::Running;
    stale.attempt = 1;
    stale.started_at = Some(Utc::now());
    assert!(h
        .ledger
        .compare_and_set(crashed_job, "a", (StageState::NotStarted, 0), stale)
        .await
        .unwrap());

    let resumed = h.orchestrator.run_job(crashed_job).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Succeeded);
    // Deterministic stages plus content addressing: the interrupted run
    // converges on the same artifacts, nothing is duplicated.
    assert_eq!(resumed.produced_artifacts, baseline.produced_artifacts);

    // The interrupted attempt was not charged.
    let a = h.ledger.get(crashed_job, "a").await.unwrap().unwrap();
    assert_eq!(a.attempt, 1);
    assert!(h
        .sink
        .events_for("a")
        .iter()
        .any(|e| e.error_kind == Some(ErrorKind::Interrupted)));
}

#[tokio::test]
async fn store_outage_pauses_without_charging_attempts() {
    let registry = StageRegistry::new().with_stage("a", Arc::new(AppendStage::new("|a")));
    let artifacts = Arc::new(FlakyArtifactStore::new(2));
    let ledger = Arc::new(InMemoryLedger::new());
    let sink = Arc::new(CollectingTelemetrySink::new());
    let orchestrator = Orchestrator::new(
        artifacts.clone(),
        Arc::new(InMemoryContextStore::new()),
        ledger.clone(),
        registry,
    )
    .with_telemetry(sink.clone())
    .with_config(OrchestratorConfig::new().with_store_retry_delay(Duration::from_millis(10)));
    let input = artifacts.put("transcript", "source", b"x").await.unwrap().id;

    let def = PipelineDefinition::new("solo").with_stage(StageNode::new("a", "a"));
    let job_id = orchestrator.submit_job(def, input).await.unwrap();
    let report = orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Succeeded);
    let entry = ledger.get(job_id, "a").await.unwrap().unwrap();
    assert_eq!(entry.attempt, 1);
    assert!(sink
        .events_for("a")
        .iter()
        .any(|e| e.error_kind == Some(ErrorKind::StoreUnavailable)));
}

/// Reads one context key and embeds what it saw into an artifact.
#[derive(Debug)]
struct EchoContextStage {
    key: String,
}

#[async_trait]
impl Stage for EchoContextStage {
    async fn execute(&self, _inputs: &[StageInput], ctx: &ContextView) -> StageOutcome {
        match ctx.get(&self.key).await {
            Ok(value) => {
                let body = serde_json::json!({ "seen": value });
                match ArtifactPayload::json("echo", &body) {
                    Ok(payload) => StageOutcome::produced(vec![payload]),
                    Err(err) => StageOutcome::fatal(err.to_string()),
                }
            }
            Err(err) => StageOutcome::retryable(err.to_string()),
        }
    }
}

#[tokio::test]
async fn context_writes_flow_to_descendants() {
    let registry = StageRegistry::new()
        .with_stage(
            "writer",
            Arc::new(StaticStage::noop().with_write("confidence", serde_json::json!(0.95))),
        )
        .with_stage(
            "reader",
            Arc::new(EchoContextStage {
                key: "confidence".into(),
            }),
        );
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("handoff")
        .with_stage(StageNode::new("a", "writer"))
        .with_stage(StageNode::new("b", "reader").with_dependency("a"));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Succeeded);
    let echoed = h
        .artifacts
        .get(&report.produced_artifacts["b"][0])
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&echoed).unwrap();
    assert_eq!(body["seen"], 0.95);

    let entry = h.context.read(job_id, "confidence").await.unwrap().unwrap();
    assert_eq!(entry.written_by, "a");
    assert_eq!(entry.version, 1);
}

#[tokio::test]
async fn sibling_context_writes_are_invisible() {
    let registry = StageRegistry::new()
        .with_stage("a", Arc::new(AppendStage::new("|a")))
        .with_stage("slow", Arc::new(SlowStage::new(Duration::from_millis(100))))
        .with_stage(
            "writer",
            Arc::new(StaticStage::noop().with_write("b_only", serde_json::json!(true))),
        )
        .with_stage("reader", Arc::new(EchoContextStage { key: "b_only".into() }));
    let h = harness(registry);
    let input = h.seed_input().await;

    // b's write is committed long before d runs, but b is not an ancestor of
    // d, so the key must stay invisible.
    let def = PipelineDefinition::new("isolated")
        .with_stage(StageNode::new("a", "a"))
        .with_stage(StageNode::new("b", "writer").with_dependency("a"))
        .with_stage(StageNode::new("c", "slow").with_dependency("a"))
        .with_stage(StageNode::new("d", "reader").with_dependency("c"));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    assert_eq!(report.status, JobStatus::Succeeded);
    let echoed = h
        .artifacts
        .get(&report.produced_artifacts["d"][0])
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&echoed).unwrap();
    assert_eq!(body["seen"], serde_json::Value::Null);
}

#[tokio::test]
async fn overwriting_a_siblings_key_fails_the_second_writer() {
    let registry = StageRegistry::new()
        .with_stage("a", Arc::new(AppendStage::new("|a")))
        .with_stage(
            "writer",
            Arc::new(StaticStage::noop().with_write("shared", serde_json::json!(1))),
        );
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("contended")
        .with_stage(StageNode::new("a", "a"))
        .with_stage(StageNode::new("b", "writer").with_dependency("a").with_retry(RetryPolicy::no_retries()))
        .with_stage(StageNode::new("c", "writer").with_dependency("a").with_retry(RetryPolicy::no_retries()));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    let report = h.orchestrator.run_job(job_id).await.unwrap();

    // Exactly one sibling owns the key; the other trips the ownership rule.
    let states = [report.stage_states["b"], report.stage_states["c"]];
    assert!(states.contains(&StageState::Succeeded));
    assert!(states.contains(&StageState::FailedFatal));
    assert_eq!(report.status, JobStatus::Failed);
}

#[tokio::test]
async fn submit_rejects_invalid_definitions() {
    let h = harness(append_registry());
    let input = h.seed_input().await;

    let cyclic = PipelineDefinition::new("cyclic")
        .with_stage(StageNode::new("a", "a").with_dependency("b"))
        .with_stage(StageNode::new("b", "b").with_dependency("a"));
    let err = h.orchestrator.submit_job(cyclic, input.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Graph(GraphError::CyclicGraph { .. })
    ));

    let unknown = PipelineDefinition::new("unknown").with_stage(StageNode::new("x", "nope"));
    let err = h.orchestrator.submit_job(unknown, input).await.unwrap_err();
    assert!(matches!(err, IngestError::UnknownStageType { .. }));
}

#[tokio::test]
async fn submit_rejects_missing_input_artifact() {
    let h = harness(append_registry());
    let ghost = ArtifactId::from_content(b"never stored");
    let err = h.orchestrator.submit_job(diamond(), ghost).await.unwrap_err();
    assert!(matches!(err, IngestError::InputArtifactMissing(_)));
}

#[tokio::test]
async fn unknown_job_id_is_reported() {
    let h = harness(append_registry());
    let err = h
        .orchestrator
        .get_job_status(crate::job::JobId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::JobNotFound(_)));
}

#[tokio::test]
async fn archive_tears_down_the_context_scope() {
    let registry = StageRegistry::new().with_stage(
        "writer",
        Arc::new(StaticStage::noop().with_write("k", serde_json::json!(1))),
    );
    let h = harness(registry);
    let input = h.seed_input().await;

    let def = PipelineDefinition::new("solo").with_stage(StageNode::new("a", "writer"));
    let job_id = h.orchestrator.submit_job(def, input).await.unwrap();
    h.orchestrator.run_job(job_id).await.unwrap();
    assert!(h.context.read(job_id, "k").await.unwrap().is_some());

    h.orchestrator.archive_job(job_id).await.unwrap();
    assert!(h.context.read(job_id, "k").await.unwrap().is_none());
    assert!(matches!(
        h.orchestrator.get_job_status(job_id).await,
        Err(IngestError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn archive_refuses_non_terminal_jobs() {
    let h = harness(append_registry());
    let input = h.seed_input().await;
    let job_id = h.orchestrator.submit_job(diamond(), input).await.unwrap();

    let err = h.orchestrator.archive_job(job_id).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidJobState { .. }));
}
