//! Append-only event journal (`events.jsonl`).
//!
//! One JSON object per line, appended under a mutex so concurrent writers
//! never interleave partial lines. The file is never rewritten or pruned;
//! consumers that need a bounded view read the tail.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;

use super::{ensure_dir, StateError};

/// Shared append-only journal handle.
#[derive(Debug)]
pub struct EventJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventJournal {
    /// Create a journal handle for `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line.
    ///
    /// An `at` timestamp is stamped into the object when the caller did not
    /// supply one.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or written.
    pub fn append(&self, event: &Value) -> Result<(), StateError> {
        let mut object = event.clone();
        if let Some(map) = object.as_object_mut() {
            map.entry("at")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }

        let line = serde_json::to_string(&object).map_err(|e| StateError::Serde {
            path: self.path.display().to_string(),
            source: e,
        })?;

        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }

        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StateError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
        writeln!(file, "{line}").map_err(|e| StateError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        drop(guard);
        Ok(())
    }

    /// Read up to `max` events from the end of the journal, oldest first.
    ///
    /// Unparseable lines are skipped: the journal outlives schema changes
    /// and a truncated final line from a crash must not poison replay.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read.
    pub fn tail(&self, max: usize) -> Result<Vec<Value>, StateError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };

        let mut events: std::collections::VecDeque<Value> = std::collections::VecDeque::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StateError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => {
                    if events.len() == max {
                        events.pop_front();
                    }
                    events.push_back(value);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable journal line");
                }
            }
        }
        Ok(events.into_iter().collect())
    }
}
