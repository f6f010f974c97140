//! Stage lifecycle telemetry: the event type and fire-and-forget sinks.

use crate::core::ErrorKind;
use crate::job::JobId;
use crate::ledger::StageState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// One stage lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// The owning job.
    pub job_id: JobId,
    /// The stage the event describes.
    pub stage_id: String,
    /// The state the stage transitioned to.
    pub state: StageState,
    /// Event timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// The attempt the event belongs to.
    pub attempt: u32,
    /// Failure classification, when the transition is a failure or skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TelemetryEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(job_id: JobId, stage_id: impl Into<String>, state: StageState, attempt: u32) -> Self {
        Self {
            job_id,
            stage_id: stage_id.into(),
            state,
            timestamp: Utc::now(),
            attempt,
            error_kind: None,
        }
    }

    /// Attaches a failure classification.
    #[must_use]
    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }
}

/// Append-only recorder for stage lifecycle events.
///
/// `emit` is fire-and-forget: implementations must never block the
/// orchestrator's critical path beyond a bounded enqueue, and must swallow
/// (at most log) their own failures.
pub trait TelemetrySink: Send + Sync {
    /// Records an event.
    fn emit(&self, event: TelemetryEvent);
}

/// Discards all events. The default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTelemetrySink;

impl TelemetrySink for NoOpTelemetrySink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Logs events through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTelemetrySink;

impl TelemetrySink for LoggingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        info!(
            job_id = %event.job_id,
            stage_id = %event.stage_id,
            state = %event.state,
            attempt = event.attempt,
            error_kind = event.error_kind.map(|k| k.to_string()),
            "stage transition"
        );
    }
}

/// Collects events in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct CollectingTelemetrySink {
    events: parking_lot::RwLock<Vec<TelemetryEvent>>,
}

impl CollectingTelemetrySink {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the collected events.
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.read().clone()
    }

    /// Returns the events recorded for one stage.
    #[must_use]
    pub fn events_for(&self, stage_id: &str) -> Vec<TelemetryEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_id == stage_id)
            .cloned()
            .collect()
    }
}

impl TelemetrySink for CollectingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.write().push(event);
    }
}

/// Forwards events into a bounded channel; drops (and counts) events when
/// the consumer falls behind rather than blocking the orchestrator.
#[derive(Debug)]
pub struct ChannelTelemetrySink {
    tx: tokio::sync::mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelTelemetrySink {
    /// Creates a sink and its receiving end with the given capacity.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of events dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Appends events to date-partitioned JSONL files (`YYYY-MM-DD.jsonl`).
///
/// Write failures are logged and swallowed; telemetry loss never fails a job.
#[derive(Debug)]
pub struct JsonlTelemetrySink {
    dir: PathBuf,
    write_lock: parking_lot::Mutex<()>,
}

impl JsonlTelemetrySink {
    /// Opens (creating if needed) a sink writing under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    fn append(&self, event: &TelemetryEvent) -> std::io::Result<()> {
        use std::io::Write;

        let file_name = format!("{}.jsonl", event.timestamp.format("%Y-%m-%d"));
        let line = serde_json::to_string(event)?;

        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file_name))?;
        writeln!(file, "{line}")
    }
}

impl TelemetrySink for JsonlTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(err) = self.append(&event) {
            warn!(error = %err, "failed to append telemetry event");
        }
    }
}
