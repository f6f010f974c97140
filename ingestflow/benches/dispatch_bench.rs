//! Benchmarks for the dispatch loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ingestflow::prelude::*;
use ingestflow::testing::AppendStage;
use std::sync::Arc;

fn diamond() -> PipelineDefinition {
    PipelineDefinition::new("diamond")
        .with_stage(StageNode::new("a", "append"))
        .with_stage(StageNode::new("b", "append").with_dependency("a"))
        .with_stage(StageNode::new("c", "append").with_dependency("a"))
        .with_stage(StageNode::new("d", "append").with_dependencies(["b", "c"]))
}

fn dispatch_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    c.bench_function("diamond_job", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let artifacts = Arc::new(InMemoryArtifactStore::new());
                let registry = StageRegistry::new()
                    .with_stage("append", Arc::new(AppendStage::new("|x")));
                let orchestrator = Orchestrator::new(
                    artifacts.clone(),
                    Arc::new(InMemoryContextStore::new()),
                    Arc::new(InMemoryLedger::new()),
                    registry,
                );

                let input = artifacts
                    .put("transcript", "source", b"bench input")
                    .await
                    .expect("seed input")
                    .id;
                let job_id = orchestrator
                    .submit_job(diamond(), input)
                    .await
                    .expect("submit");
                black_box(orchestrator.run_job(job_id).await.expect("run"))
            })
        });
    });

    c.bench_function("ready_set_diamond", |b| {
        let definition = diamond();
        let states = definition
            .stage_ids()
            .map(|id| (id.to_string(), LedgerEntry::not_started(id)))
            .collect();
        b.iter(|| black_box(definition.ready_set(&states)));
    });
}

criterion_group!(benches, dispatch_benchmark);
criterion_main!(benches);
