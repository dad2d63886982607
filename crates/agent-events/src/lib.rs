//! Append-only JSONL audit log for job and step lifecycle transitions.
//!
//! Separate from `tracing`-based logging: this log is a structured record
//! of *what happened to a job*, read back by operators and tests, not a
//! debugging trace. Each event also gets a `tracing::info!` emission at
//! the call site so it shows up in normal log output too.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(events_dir: &Path) -> PathBuf {
    events_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobFinished { state: String },
    StepStarted { step_id: String },
    StepFinished { step_id: String, state: String },
    ActionFetched { identifier: String, cached: bool },
    Reconnected { attempt: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub kind: EventKind,
}

/// In-memory buffer of recorded events, flushed to disk in one append.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: Event) {
        tracing::info!(job_id = %event.job_id, kind = ?event.kind, "job event");
        self.events.push(event);
    }

    /// Appends every buffered event to `path` as JSONL, creating parent
    /// directories as needed, then clears the buffer.
    pub fn flush(&mut self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        self.events.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Reads back every event from a JSONL file, for tests and operator
/// inspection. Missing file returns an empty vec rather than an error.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read events line")?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).context("failed to parse event line")?);
    }
    Ok(events)
}
