//! State directory layout and on-disk primitives.
//!
//! Every durable record in the system is a JSON file under one state root.
//! This module owns the conventions the stores build on:
//!
//! - one file per record under a per-component subdirectory,
//! - index files for small collections under `builtins/`,
//! - atomic writes (`X.tmp` + rename) so readers never see a torn file,
//! - exclusive-create lock files under `locks/`,
//! - an append-only `events.jsonl` journal.
//!
//! Directory creation is lazy and idempotent: stores call
//! [`ensure_dir`] before their first write.

mod journal;

pub use journal::EventJournal;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by on-disk primitives.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem operation failed.
    #[error("i/o error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Record could not be serialized or parsed.
    #[error("serialization error at {path}: {source}")]
    Serde {
        /// Path of the offending record.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

impl StateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn serde(path: &Path, source: serde_json::Error) -> Self {
        Self::Serde {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Resolved locations of every component's records under the state root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// State root directory.
    pub root: PathBuf,
    /// Per-job records (`jobs/<id>.json`).
    pub jobs_dir: PathBuf,
    /// Job receipts (`receipts/<id>.json`).
    pub receipts_dir: PathBuf,
    /// Claim lock files (`locks/<id>.lock`).
    pub locks_dir: PathBuf,
    /// Outbound notifications (`notifications/<id>.json`).
    pub notifications_dir: PathBuf,
    /// Artifacts produced by run-spec steps.
    pub artifacts_dir: PathBuf,
    /// Rotated JSON log files.
    pub logs_dir: PathBuf,
    /// Index files for small collections.
    pub builtins_dir: PathBuf,
    /// Run-spec records (`builtins/run_specs/<runId>.json`).
    pub run_specs_dir: PathBuf,
    /// Append-only event journal (`events.jsonl`).
    pub events_log: PathBuf,
    /// Approval token index.
    pub approvals_index: PathBuf,
    /// Reminder index.
    pub reminders_index: PathBuf,
    /// Notes index.
    pub notes_index: PathBuf,
    /// Task items index.
    pub tasks_index: PathBuf,
    /// Inbound dedupe fingerprint index.
    pub dedupe_index: PathBuf,
}

impl StatePaths {
    /// Resolve all paths under `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let builtins_dir = root.join("builtins");
        Self {
            jobs_dir: root.join("jobs"),
            receipts_dir: root.join("receipts"),
            locks_dir: root.join("locks"),
            notifications_dir: root.join("notifications"),
            artifacts_dir: root.join("artifacts"),
            logs_dir: root.join("logs"),
            run_specs_dir: builtins_dir.join("run_specs"),
            events_log: root.join("events.jsonl"),
            approvals_index: builtins_dir.join("approvals.json"),
            reminders_index: builtins_dir.join("reminders.json"),
            notes_index: builtins_dir.join("notes.json"),
            tasks_index: builtins_dir.join("tasks.json"),
            dedupe_index: builtins_dir.join("dedupe.json"),
            builtins_dir,
            root,
        }
    }

    /// Path of a job record.
    pub fn job_file(&self, id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{id}.json"))
    }

    /// Path of a job receipt.
    pub fn receipt_file(&self, id: &str) -> PathBuf {
        self.receipts_dir.join(format!("{id}.json"))
    }

    /// Path of a job claim lock.
    pub fn lock_file(&self, id: &str) -> PathBuf {
        self.locks_dir.join(format!("{id}.lock"))
    }

    /// Path of a notification record.
    pub fn notification_file(&self, id: &str) -> PathBuf {
        self.notifications_dir.join(format!("{id}.json"))
    }

    /// Path of a run-spec record.
    pub fn run_spec_file(&self, run_id: &str) -> PathBuf {
        self.run_specs_dir.join(format!("{run_id}.json"))
    }

    /// Create every directory the layout names.
    ///
    /// # Errors
    ///
    /// Returns an error when a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<(), StateError> {
        for dir in [
            &self.root,
            &self.jobs_dir,
            &self.receipts_dir,
            &self.locks_dir,
            &self.notifications_dir,
            &self.artifacts_dir,
            &self.logs_dir,
            &self.builtins_dir,
            &self.run_specs_dir,
        ] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

/// Create a directory (and parents) if it does not exist.
///
/// # Errors
///
/// Returns an error when creation fails for a reason other than the
/// directory already existing.
pub fn ensure_dir(dir: &Path) -> Result<(), StateError> {
    fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))
}

/// Atomically write a record: serialize to `<path>.tmp`, then rename.
///
/// Readers either see the previous complete file or the new complete file,
/// never a partial write.
///
/// # Errors
///
/// Returns an error on serialization or filesystem failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StateError::serde(path, e))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|e| StateError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))
}

/// Read and parse a JSON record. A missing file is `Ok(None)`.
///
/// # Errors
///
/// Returns an error on filesystem failure or malformed JSON.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StateError::serde(path, e))
}

/// List `*.json` record files in a directory. A missing directory is empty.
///
/// # Errors
///
/// Returns an error when the directory exists but cannot be read.
pub fn list_record_files(dir: &Path) -> Result<Vec<PathBuf>, StateError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StateError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StateError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Try to acquire an exclusive-create lock file.
///
/// Returns `true` when this caller created the file, `false` when it
/// already exists (someone else holds the lock).
///
/// # Errors
///
/// Returns an error on filesystem failure other than "already exists".
pub fn try_acquire_lock(path: &Path) -> Result<bool, StateError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StateError::io(path, e)),
    }
}

/// Release a lock file. Releasing an absent lock is a no-op.
pub fn release_lock(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to release lock file");
        }
    }
}
