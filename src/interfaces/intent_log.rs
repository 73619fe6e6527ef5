//! Append-only log of applied intents, for audit and replay.

use crate::core::agent_id::AgentId;
use crate::core::intent::Intent;
use crate::simulation::settlement::ApplyOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntentLogError {
    #[error("intent log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("intent log serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("intent log line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("intent log lock poisoned")]
    Poisoned,
}

/// One applied intent, keyed by `(step, agent_id)`; `sequence` is its
/// position in the step's application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: u64,
    pub sequence: u32,
    pub agent_id: AgentId,
    pub intent: Intent,
    pub outcome: ApplyOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(sequence: u32, intent: Intent, outcome: ApplyOutcome) -> Self {
        Self {
            step: intent.step(),
            sequence,
            agent_id: intent.agent_id().clone(),
            intent,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// Durable sink for applied intents. Appends are best-effort from the
/// round's point of view.
pub trait IntentLog: Send {
    fn append(&mut self, entry: &LogEntry) -> Result<(), IntentLogError>;

    /// Called once at the end of every round.
    fn flush(&mut self) -> Result<(), IntentLogError> {
        Ok(())
    }
}

/// JSON-lines file log.
pub struct JsonLinesLog {
    writer: BufWriter<File>,
}

impl JsonLinesLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IntentLogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Truncate `path` and start a fresh log.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, IntentLogError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path.as_ref())?),
        })
    }
}

impl IntentLog for JsonLinesLog {
    fn append(&mut self, entry: &LogEntry) -> Result<(), IntentLogError> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IntentLogError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory log. Clones share the same buffer, so a test can keep one
/// handle while the simulation owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IntentLog for MemoryLog {
    fn append(&mut self, entry: &LogEntry) -> Result<(), IntentLogError> {
        self.entries
            .lock()
            .map_err(|_| IntentLogError::Poisoned)?
            .push(entry.clone());
        Ok(())
    }
}

/// Read a JSON-lines log back, skipping blank lines.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogEntry>, IntentLogError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| IntentLogError::Corrupt {
            line: index + 1,
            reason: e.to_string(),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intent::Action;
    use rust_decimal_macros::dec;

    fn entry(seq: u32) -> LogEntry {
        LogEntry::new(
            seq,
            Intent::new(AgentId::new("A"), 4, Action::PostMargin { amount: dec!(5) }),
            ApplyOutcome::Applied,
        )
    }

    #[test]
    fn test_memory_log_shares_buffer() {
        let log = MemoryLog::new();
        let mut handle = log.clone();
        handle.append(&entry(0)).unwrap();
        handle.append(&entry(1)).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].sequence, 1);
    }

    #[test]
    fn test_json_lines_round_trip() {
        let path = std::env::temp_dir().join(format!("intent-log-{}.jsonl", uuid::Uuid::new_v4()));
        {
            let mut log = JsonLinesLog::create(&path).unwrap();
            log.append(&entry(0)).unwrap();
            log.append(&entry(1)).unwrap();
            log.flush().unwrap();
        }
        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].step, 4);
        assert_eq!(
            entries[0].intent.action(),
            &Action::PostMargin { amount: dec!(5) }
        );
        assert_eq!(entries[1].outcome, ApplyOutcome::Applied);
        std::fs::remove_file(&path).ok();
    }
}
