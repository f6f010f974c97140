//! Command-line knowledge ingestion.
//!
//! Wires the five deterministic stages into the orchestrator, runs one job
//! per invocation, and prints the confidence evolution report.

mod stages;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ingestflow::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ingestflow", about = "Knowledge ingestion engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest a transcript file through the five-stage pipeline
    Ingest {
        /// Path to the transcript file
        file: PathBuf,
        /// Project identifier, recorded with the run
        #[arg(long)]
        project: String,
        /// Directory for artifacts and telemetry
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Directory holding retrievable context documents (JSON)
        #[arg(long, default_value = "context_store")]
        context_dir: PathBuf,
    },
    /// Show an artifact's details and lineage chain
    Lineage {
        /// Content hash of the artifact to trace
        artifact_id: String,
        /// Directory for artifacts and telemetry
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ingest {
            file,
            project,
            data_dir,
            context_dir,
        } => ingest(&file, &project, &data_dir, &context_dir).await,
        Command::Lineage {
            artifact_id,
            data_dir,
        } => lineage(&artifact_id, &data_dir).await,
    }
}

async fn ingest(
    file: &PathBuf,
    project: &str,
    data_dir: &PathBuf,
    context_dir: &PathBuf,
) -> anyhow::Result<()> {
    let raw_text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let artifacts = Arc::new(
        FsArtifactStore::open(data_dir.join("artifacts"))
            .await
            .context("failed to open artifact store")?,
    );
    let telemetry = Arc::new(
        JsonlTelemetrySink::open(data_dir.join("telemetry"))
            .context("failed to open telemetry sink")?,
    );
    let registry = stages::ingestion_registry(context_dir.clone())
        .context("failed to build stage registry")?;

    let orchestrator = Orchestrator::new(
        artifacts.clone(),
        Arc::new(InMemoryContextStore::new()),
        Arc::new(InMemoryLedger::new()),
        registry,
    )
    .with_telemetry(telemetry);

    let input = artifacts
        .put("raw_input", "source", raw_text.as_bytes())
        .await
        .context("failed to store input artifact")?;

    let job_id = orchestrator
        .submit_job(stages::ingestion_pipeline(), input.id)
        .await
        .context("failed to submit job")?;
    let report = orchestrator.run_job(job_id).await.context("job failed")?;
    info!(job_id = %job_id, status = %report.status, "ingestion job finished");

    if report.status != JobStatus::Succeeded {
        bail!("ingestion ended with status '{}'", report.status);
    }

    print_report(project, &report, artifacts.as_ref()).await
}

async fn print_report(
    project: &str,
    report: &JobReport,
    artifacts: &FsArtifactStore,
) -> anyhow::Result<()> {
    let stage_order = ["normalize", "extract", "contextualize", "insight", "validate"];
    let stage_labels = ["Normalize", "Extract", "Contextualize", "Insight", "Validate"];

    let mut bodies = Vec::with_capacity(stage_order.len());
    for stage in stage_order {
        let id = report
            .produced_artifacts
            .get(stage)
            .and_then(|ids| ids.first())
            .with_context(|| format!("stage '{stage}' produced no artifact"))?;
        let raw = artifacts.get(id).await?;
        let body: serde_json::Value = serde_json::from_slice(&raw)?;
        bodies.push(body);
    }

    println!();
    println!("{}", "=".repeat(60));
    println!("INGESTION COMPLETE");
    println!("{}", "=".repeat(60));
    println!();
    println!("Run ID: {project}");
    println!("Job ID: {}", report.job_id);
    println!();
    println!("Confidence Evolution:");

    let mut previous: Option<f64> = None;
    for (label, body) in stage_labels.iter().zip(&bodies) {
        let confidence = body["confidence"].as_f64().unwrap_or(0.0);
        match previous {
            None => println!("  {label:15} {confidence:.2}"),
            Some(prev) => {
                let arrow = if confidence > prev {
                    "↑"
                } else if confidence < prev {
                    "↓"
                } else {
                    "→"
                };
                println!("  {label:15} {confidence:.2} {arrow}");
            }
        }
        previous = Some(confidence);
    }

    let validated = &bodies[bodies.len() - 1];
    let referenced = validated["referenced_context"]
        .as_array()
        .map_or(0, Vec::len);
    println!();
    println!(
        "Final Status: {}",
        validated["status"].as_str().unwrap_or("unknown")
    );
    println!(
        "Hallucination Risk: {}",
        validated["hallucination_risk"].as_str().unwrap_or("unknown")
    );
    println!("Referenced Context: {referenced} item(s)");
    println!();
    println!("{}", "=".repeat(60));
    println!();
    Ok(())
}

async fn lineage(artifact_id: &str, data_dir: &PathBuf) -> anyhow::Result<()> {
    let store = FsArtifactStore::open(data_dir.join("artifacts"))
        .await
        .context("failed to open artifact store")?;
    for line in lineage_lines(&store, &ArtifactId::from_hex(artifact_id)).await? {
        println!("{line}");
    }
    Ok(())
}

/// Renders the details and lineage-chain report for one artifact.
///
/// The chain follows each artifact's `derived_from` ids depth-first until it
/// reaches the raw input, whose content carries no lineage field.
async fn lineage_lines(
    store: &FsArtifactStore,
    id: &ArtifactId,
) -> anyhow::Result<Vec<String>> {
    let meta = store
        .metadata(id)
        .await
        .with_context(|| format!("artifact '{id}' not found"))?;
    let body: Option<serde_json::Value> = serde_json::from_slice(&store.get(id).await?).ok();

    let mut lines = vec![
        String::new(),
        "=".repeat(60),
        "ARTIFACT DETAILS".to_string(),
        "=".repeat(60),
        String::new(),
        format!("Artifact ID: {}", meta.id),
        format!("Kind: {}", meta.kind),
        format!("Produced By: {}", meta.produced_by),
        format!("Created At: {}", meta.created_at),
        format!("Size: {} byte(s)", meta.size_bytes),
    ];
    if let Some(body) = &body {
        if let Some(confidence) = body["confidence"].as_f64() {
            lines.push(format!("Confidence: {confidence:.2}"));
        }
        if let Some(status) = body["status"].as_str() {
            lines.push(format!("Status: {status}"));
        }
        if let Some(referenced) = body["referenced_context"].as_array() {
            lines.push(format!("Referenced Context: {} item(s)", referenced.len()));
            for ctx_id in referenced.iter().filter_map(serde_json::Value::as_str) {
                lines.push(format!("  - {ctx_id}"));
            }
        }
    }

    lines.push(String::new());
    lines.push("=".repeat(60));
    lines.push("LINEAGE CHAIN".to_string());
    lines.push("=".repeat(60));
    lines.push(String::new());

    let chain_start = lines.len();
    let mut pending = vec![(id.clone(), 0_usize)];
    while let Some((link_id, level)) = pending.pop() {
        let link_meta = store
            .metadata(&link_id)
            .await
            .with_context(|| format!("lineage parent '{link_id}' not found"))?;
        let link_body: Option<serde_json::Value> =
            serde_json::from_slice(&store.get(&link_id).await?).ok();

        let described = match link_body.as_ref().and_then(|b| b["confidence"].as_f64()) {
            Some(confidence) => format!(
                "{} (stage {}, conf={confidence:.2})",
                link_meta.kind, link_meta.produced_by
            ),
            None => format!("{} (stage {})", link_meta.kind, link_meta.produced_by),
        };
        if level == 0 {
            lines.push(described);
        } else {
            lines.push(format!("{}└─ {described}", "   ".repeat(level)));
        }

        if let Some(parents) = link_body.as_ref().and_then(|b| b["derived_from"].as_array()) {
            for parent in parents.iter().rev().filter_map(serde_json::Value::as_str) {
                pending.push((ArtifactId::from_hex(parent), level + 1));
            }
        }
    }
    if lines.len() == chain_start + 1 {
        lines.push("(No parent artifacts)".to_string());
    }
    lines.push(String::new());
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn lineage_walks_derived_from_to_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();

        let raw = store
            .put("raw_input", "source", b"Alice: hello")
            .await
            .unwrap();
        let transcript = store
            .put(
                "transcript",
                "normalize",
                serde_json::json!({
                    "text": "Speaker 1: hello",
                    "confidence": 0.95,
                    "derived_from": [raw.id],
                })
                .to_string()
                .as_bytes(),
            )
            .await
            .unwrap();
        let extraction = store
            .put(
                "extraction",
                "extract",
                serde_json::json!({
                    "summary": "hello",
                    "confidence": 0.85,
                    "derived_from": [transcript.id],
                })
                .to_string()
                .as_bytes(),
            )
            .await
            .unwrap();

        let lines = lineage_lines(&store, &extraction.id).await.unwrap();
        let chain: Vec<&str> = lines
            .iter()
            .map(String::as_str)
            .filter(|line| line.contains("(stage "))
            .collect();
        assert_eq!(
            chain,
            vec![
                "extraction (stage extract, conf=0.85)",
                "   └─ transcript (stage normalize, conf=0.95)",
                "      └─ raw_input (stage source)",
            ]
        );
    }

    #[tokio::test]
    async fn lineage_of_a_root_artifact_has_no_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let raw = store
            .put("raw_input", "source", b"plain text")
            .await
            .unwrap();

        let lines = lineage_lines(&store, &raw.id).await.unwrap();
        assert!(lines.contains(&format!("Artifact ID: {}", raw.id)));
        assert!(lines.contains(&"(No parent artifacts)".to_string()));
    }

    #[tokio::test]
    async fn lineage_of_an_unknown_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let ghost = ArtifactId::from_content(b"never stored");
        assert!(lineage_lines(&store, &ghost).await.is_err());
    }
}
