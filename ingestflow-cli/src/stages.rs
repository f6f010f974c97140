//! The five deterministic ingestion stages.
//!
//! Every stage is a pure function of its input artifact (plus, for
//! contextualization, the context document directory), so re-running a stage
//! always reproduces the same artifact bytes.

use async_trait::async_trait;
use ingestflow::prelude::*;
use regex::Regex;
use std::path::PathBuf;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "for", "to", "of", "in", "on", "at", "with", "we", "i", "it",
    "that", "this", "is", "are", "was", "were",
];

fn single_input(inputs: &[StageInput]) -> Result<&StageInput, StageOutcome> {
    inputs
        .first()
        .ok_or_else(|| StageOutcome::fatal("expected exactly one input artifact"))
}

fn input_json(input: &StageInput) -> Result<serde_json::Value, StageOutcome> {
    input
        .json()
        .map_err(|err| StageOutcome::fatal(format!("input is not valid JSON: {err}")))
}

fn confidence_of(value: &serde_json::Value) -> f64 {
    value["confidence"].as_f64().unwrap_or(0.0)
}

/// Wraps a stage body into the produced outcome. Every derived artifact
/// records its parent ids so `lineage` can walk the chain back to the input.
fn emit(input: &StageInput, kind: &str, mut body: serde_json::Value) -> StageOutcome {
    if let Some(fields) = body.as_object_mut() {
        fields.insert(
            "derived_from".to_string(),
            serde_json::json!([input.artifact.id]),
        );
    }
    match ArtifactPayload::json(kind, &body) {
        Ok(payload) => StageOutcome::produced(vec![payload])
            .with_context_write("confidence", body["confidence"].clone()),
        Err(err) => StageOutcome::fatal(format!("failed to serialize output: {err}")),
    }
}

/// Cleans raw text and standardizes speaker labels to `Speaker N:`.
#[derive(Debug)]
pub struct NormalizeStage {
    speaker: Regex,
    blank_lines: Regex,
}

impl NormalizeStage {
    /// Compiles the stage's patterns.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            speaker: Regex::new(r"^([A-Za-z][A-Za-z\s]+?):\s*(.*)$")?,
            blank_lines: Regex::new(r"\n\s*\n+")?,
        })
    }

    fn clean_text(&self, text: &str) -> String {
        self.blank_lines
            .replace_all(text.trim(), "\n\n")
            .into_owned()
    }

    fn standardize_speakers(&self, text: &str) -> String {
        let mut speaker_map: Vec<(String, usize)> = Vec::new();
        let mut lines = Vec::new();
        for line in text.split('\n') {
            if let Some(caps) = self.speaker.captures(line) {
                let name = caps[1].trim().to_string();
                let dialogue = &caps[2];
                let number = match speaker_map.iter().find(|(n, _)| *n == name) {
                    Some((_, number)) => *number,
                    None => {
                        let number = speaker_map.len() + 1;
                        speaker_map.push((name, number));
                        number
                    }
                };
                lines.push(format!("Speaker {number}: {dialogue}"));
            } else {
                lines.push(line.to_string());
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Stage for NormalizeStage {
    async fn execute(&self, inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let input = match single_input(inputs) {
            Ok(input) => input,
            Err(outcome) => return outcome,
        };
        let text = self.standardize_speakers(&self.clean_text(&input.text()));
        emit(
            input,
            "transcript",
            serde_json::json!({ "text": text, "confidence": 0.95 }),
        )
    }
}

/// Extracts a summary, task lines, and decision lines from a transcript.
#[derive(Debug)]
pub struct ExtractStage {
    speaker_prefix: Regex,
}

impl ExtractStage {
    /// Compiles the stage's patterns.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            speaker_prefix: Regex::new(r"^Speaker \d+:\s*")?,
        })
    }

    fn summary(&self, text: &str) -> String {
        text.split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(2)
            .map(|line| self.speaker_prefix.replace(line, "").into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn lines_containing(text: &str, needles: &[&str]) -> Vec<String> {
    text.split('\n')
        .filter(|line| {
            let lower = line.to_lowercase();
            needles.iter().any(|needle| lower.contains(needle))
        })
        .map(|line| line.trim().to_string())
        .collect()
}

#[async_trait]
impl Stage for ExtractStage {
    async fn execute(&self, inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let input = match single_input(inputs) {
            Ok(input) => input,
            Err(outcome) => return outcome,
        };
        let body = match input_json(input) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };
        let Some(text) = body["text"].as_str() else {
            return StageOutcome::fatal("transcript artifact has no 'text' field");
        };

        emit(
            input,
            "extraction",
            serde_json::json!({
                "summary": self.summary(text),
                "tasks": lines_containing(text, &["will", "action", "todo"]),
                "decisions": lines_containing(text, &["decided", "agree"]),
                "confidence": 0.85,
            }),
        )
    }
}

/// One retrievable context document.
#[derive(Debug, Clone)]
pub struct ContextDoc {
    /// Stable document identifier.
    pub context_id: String,
    /// Full document text used for word-containment matching.
    pub content: String,
}

/// Enriches an extraction with deterministically retrieved context documents.
///
/// Retrieval is word containment over the summary: a document matches when
/// any significant summary word (length >= 3, not a stopword) appears in its
/// content. Confidence rises 0.02 per match, capped at 0.95.
#[derive(Debug)]
pub struct ContextualizeStage {
    context_dir: PathBuf,
}

impl ContextualizeStage {
    /// Creates a stage reading context documents from `context_dir`.
    #[must_use]
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
        }
    }

    fn load_docs(&self) -> Vec<ContextDoc> {
        let Ok(entries) = std::fs::read_dir(&self.context_dir) else {
            return Vec::new();
        };
        let mut docs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            // Unreadable or malformed documents are skipped, not fatal.
            let Ok(raw) = std::fs::read(&path) else {
                continue;
            };
            let Ok(body) = serde_json::from_slice::<serde_json::Value>(&raw) else {
                continue;
            };
            if let (Some(context_id), Some(content)) =
                (body["context_id"].as_str(), body["content"].as_str())
            {
                docs.push(ContextDoc {
                    context_id: context_id.to_string(),
                    content: content.to_string(),
                });
            }
        }
        docs.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        docs
    }
}

/// Splits a summary into lowercase words worth matching on.
pub fn significant_words(summary: &str) -> Vec<String> {
    summary
        .to_lowercase()
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| ".,!?;:()[]{}\"'-".contains(c)))
        .filter(|word| word.len() >= 3 && !STOPWORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Returns the ids of documents containing any significant summary word.
pub fn retrieve_context_ids(summary: &str, docs: &[ContextDoc]) -> Vec<String> {
    let words = significant_words(summary);
    docs.iter()
        .filter(|doc| {
            let content = doc.content.to_lowercase();
            words.iter().any(|word| content.contains(word))
        })
        .map(|doc| doc.context_id.clone())
        .collect()
}

/// Confidence after context enrichment: +0.02 per document, capped at 0.95.
#[must_use]
pub fn contextualize_confidence(base: f64, num_contexts: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let boosted = base + num_contexts as f64 * 0.02;
    boosted.min(0.95)
}

#[async_trait]
impl Stage for ContextualizeStage {
    async fn execute(&self, inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let input = match single_input(inputs) {
            Ok(input) => input,
            Err(outcome) => return outcome,
        };
        let body = match input_json(input) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };
        let summary = body["summary"].as_str().unwrap_or_default();

        let docs = self.load_docs();
        let referenced = retrieve_context_ids(summary, &docs);
        let confidence = contextualize_confidence(confidence_of(&body), referenced.len());

        emit(
            input,
            "contextualized_extraction",
            serde_json::json!({
                "summary": summary,
                "tasks": body["tasks"],
                "decisions": body["decisions"],
                "referenced_context": referenced,
                "confidence": confidence,
            }),
        )
    }
}

/// Turns a contextualized extraction into recommendations and risk flags.
///
/// Interpretation costs 0.03 confidence, floored at 0.70.
#[derive(Debug, Default)]
pub struct InsightStage;

impl InsightStage {
    /// Creates the stage.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn recommendations(has_tasks: bool, has_decisions: bool) -> Vec<&'static str> {
    let mut recommendations = Vec::new();
    if has_tasks {
        recommendations.push("Review task ownership and deadlines.");
    }
    if has_decisions {
        recommendations.push("Validate decision impact on project timeline.");
    }
    if !has_tasks {
        recommendations.push("No action items detected.");
    }
    recommendations
}

/// Risk flags derived from the pre-insight confidence.
pub fn risk_flags(confidence: f64) -> Vec<&'static str> {
    if confidence < 0.88 {
        vec!["low_confidence"]
    } else {
        Vec::new()
    }
}

/// Confidence after interpretation: -0.03, floored at 0.70.
#[must_use]
pub fn insight_confidence(base: f64) -> f64 {
    (base - 0.03).max(0.70)
}

#[async_trait]
impl Stage for InsightStage {
    async fn execute(&self, inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let input = match single_input(inputs) {
            Ok(input) => input,
            Err(outcome) => return outcome,
        };
        let body = match input_json(input) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };
        let base = confidence_of(&body);
        let has_tasks = body["tasks"].as_array().is_some_and(|t| !t.is_empty());
        let has_decisions = body["decisions"].as_array().is_some_and(|d| !d.is_empty());

        emit(
            input,
            "insight",
            serde_json::json!({
                "recommendations": recommendations(has_tasks, has_decisions),
                "risk_flags": risk_flags(base),
                "source_summary": body["summary"],
                "referenced_context": body["referenced_context"],
                "confidence": insight_confidence(base),
            }),
        )
    }
}

/// Scores an insight for quality and assigns the final status.
#[derive(Debug, Default)]
pub struct ValidateStage;

impl ValidateStage {
    /// Creates the stage.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Validation score: -0.05 per penalty (low confidence flag, no context),
/// floored at 0.60.
#[must_use]
pub fn validation_score(confidence: f64, low_confidence: bool, num_contexts: usize) -> f64 {
    let mut score = confidence;
    if low_confidence {
        score -= 0.05;
    }
    if num_contexts == 0 {
        score -= 0.05;
    }
    score.max(0.60)
}

/// Hallucination risk is medium without grounding context or below 0.80
/// confidence, low otherwise.
#[must_use]
pub fn hallucination_risk(num_contexts: usize, confidence: f64) -> &'static str {
    if num_contexts == 0 || confidence < 0.80 {
        "medium"
    } else {
        "low"
    }
}

/// Final status: validated at 0.85 or above, review required below.
#[must_use]
pub fn validation_status(score: f64) -> &'static str {
    if score >= 0.85 {
        "validated"
    } else {
        "review_required"
    }
}

#[async_trait]
impl Stage for ValidateStage {
    async fn execute(&self, inputs: &[StageInput], _ctx: &ContextView) -> StageOutcome {
        let input = match single_input(inputs) {
            Ok(input) => input,
            Err(outcome) => return outcome,
        };
        let body = match input_json(input) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };
        let confidence = confidence_of(&body);
        let low_confidence = body["risk_flags"]
            .as_array()
            .is_some_and(|flags| flags.iter().any(|f| f == "low_confidence"));
        let num_contexts = body["referenced_context"]
            .as_array()
            .map_or(0, Vec::len);

        let score = validation_score(confidence, low_confidence, num_contexts);
        emit(
            input,
            "validated_insight",
            serde_json::json!({
                "recommendations": body["recommendations"],
                "risk_flags": body["risk_flags"],
                "referenced_context": body["referenced_context"],
                "validation_score": score,
                "hallucination_risk": hallucination_risk(num_contexts, confidence),
                "status": validation_status(score),
                "confidence": score,
            }),
        )
        .with_context_write("validation_status", serde_json::json!(validation_status(score)))
    }
}

/// Builds the five-stage ingestion pipeline definition.
#[must_use]
pub fn ingestion_pipeline() -> PipelineDefinition {
    PipelineDefinition::new("ingest")
        .with_stage(StageNode::new("normalize", "normalize"))
        .with_stage(StageNode::new("extract", "extract").with_dependency("normalize"))
        .with_stage(StageNode::new("contextualize", "contextualize").with_dependency("extract"))
        .with_stage(StageNode::new("insight", "insight").with_dependency("contextualize"))
        .with_stage(StageNode::new("validate", "validate").with_dependency("insight"))
}

/// Registers the five stage implementations.
pub fn ingestion_registry(context_dir: PathBuf) -> Result<StageRegistry, regex::Error> {
    use std::sync::Arc;
    Ok(StageRegistry::new()
        .with_stage("normalize", Arc::new(NormalizeStage::new()?))
        .with_stage("extract", Arc::new(ExtractStage::new()?))
        .with_stage("contextualize", Arc::new(ContextualizeStage::new(context_dir)))
        .with_stage("insight", Arc::new(InsightStage::new()))
        .with_stage("validate", Arc::new(ValidateStage::new())))
}
