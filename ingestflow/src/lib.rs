//! # Ingestflow
//!
//! A pipeline orchestration engine for knowledge ingestion.
//!
//! Ingestflow turns raw captured content (meeting transcripts, documents,
//! notes) into structured knowledge by running it through a directed acyclic
//! graph of processing stages:
//!
//! - **DAG scheduling**: stages dispatch as soon as their dependencies settle,
//!   up to a configurable concurrency bound
//! - **Durable execution ledger**: every transition is a compare-and-set
//!   record, making jobs resumable after a crash
//! - **Content-addressed artifacts**: identical content maps to identical
//!   ids, so re-execution is idempotent
//! - **Retries with backoff**: transient failures are retried per-stage;
//!   fatal failures skip the downstream cone
//! - **Cooperative cancellation**: in-flight stages get a grace window, no
//!   work is force-terminated mid-write
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ingestflow::prelude::*;
//!
//! let registry = StageRegistry::new()
//!     .with_stage("normalize", Arc::new(NormalizeStage::new()));
//! let orchestrator = Orchestrator::new(artifacts, context, ledger, registry);
//!
//! let definition = PipelineDefinition::new("ingest")
//!     .with_stage(StageNode::new("normalize", "normalize"));
//! let job_id = orchestrator.submit_job(definition, input_id).await?;
//! let report = orchestrator.run_job(job_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod stages;
pub mod store;
pub mod telemetry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{
        Artifact, ArtifactId, ArtifactPayload, ContextEntry, ContextView, ContextWrite,
        ErrorKind, StageOutcome,
    };
    pub use crate::errors::{GraphError, IngestError, StoreError};
    pub use crate::job::{Job, JobId, JobReport, JobStatus};
    pub use crate::ledger::{ExecutionLedger, InMemoryLedger, LedgerEntry, StageState};
    pub use crate::orchestrator::{Orchestrator, StageRegistry};
    pub use crate::pipeline::{
        BackoffStrategy, JitterStrategy, PipelineDefinition, RetryPolicy, StageNode,
    };
    pub use crate::stages::{FnStage, Stage, StageInput};
    pub use crate::store::{
        ArtifactStore, ContextStore, FsArtifactStore, InMemoryArtifactStore,
        InMemoryContextStore,
    };
    pub use crate::telemetry::{
        ChannelTelemetrySink, CollectingTelemetrySink, JsonlTelemetrySink, LoggingTelemetrySink,
        NoOpTelemetrySink, TelemetryEvent, TelemetrySink,
    };
}
