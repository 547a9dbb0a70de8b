//! Session-scoped built-in collections: notes and task items.
//!
//! Small per-user lists the assistant manages on request ("note this
//! down", "add a task"). Each collection is one index file under
//! `builtins/`, written atomically on every mutation.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state::{self, StateError, StatePaths};

/// Bounds applied to listing limits.
const LIMIT_RANGE: (usize, usize) = (1, 500);

/// A free-text note attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Opaque UUID record id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Note body.
    pub text: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Task item lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskItemStatus {
    /// Still to do.
    Open,
    /// Completed.
    Done,
}

/// A to-do item attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    /// Opaque UUID record id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Task body.
    pub text: String,
    /// Lifecycle state.
    pub status: TaskItemStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Errors raised by the built-in stores.
#[derive(Debug, Error)]
pub enum BuiltinsError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// Note or task body was empty.
    #[error("invalid_note_payload")]
    EmptyText,
    /// No record with the given id in the session.
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Index-file store for notes.
#[derive(Debug)]
pub struct NoteStore {
    paths: Arc<StatePaths>,
    write_lock: Mutex<()>,
}

impl NoteStore {
    /// Create a store handle.
    pub fn new(paths: Arc<StatePaths>) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    /// Add a note for a session.
    ///
    /// # Errors
    ///
    /// Returns [`BuiltinsError::EmptyText`] on a blank body.
    pub fn add(&self, session_id: &str, text: &str) -> Result<Note, BuiltinsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BuiltinsError::EmptyText);
        }
        let note = Note {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            text: text.to_owned(),
            created_at: Utc::now(),
        };

        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut notes: Vec<Note> =
            state::read_json(&self.paths.notes_index)?.unwrap_or_default();
        notes.push(note.clone());
        state::write_json_atomic(&self.paths.notes_index, &notes)?;
        drop(guard);
        Ok(note)
    }

    /// Notes for a session, newest first, bounded to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read.
    pub fn list(&self, session_id: &str, limit: usize) -> Result<Vec<Note>, BuiltinsError> {
        let mut notes: Vec<Note> = state::read_json(&self.paths.notes_index)?
            .unwrap_or_default();
        notes.retain(|n: &Note| n.session_id == session_id);
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        notes.truncate(limit.clamp(LIMIT_RANGE.0, LIMIT_RANGE.1));
        Ok(notes)
    }
}

/// Index-file store for task items.
#[derive(Debug)]
pub struct TaskItemStore {
    paths: Arc<StatePaths>,
    write_lock: Mutex<()>,
}

impl TaskItemStore {
    /// Create a store handle.
    pub fn new(paths: Arc<StatePaths>) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    /// Add an open task for a session.
    ///
    /// # Errors
    ///
    /// Returns [`BuiltinsError::EmptyText`] on a blank body.
    pub fn add(&self, session_id: &str, text: &str) -> Result<TaskItem, BuiltinsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BuiltinsError::EmptyText);
        }
        let task = TaskItem {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            text: text.to_owned(),
            status: TaskItemStatus::Open,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.mutate(|tasks| {
            tasks.push(task.clone());
            Ok(())
        })?;
        Ok(task)
    }

    /// Mark a session's task as done. Idempotent for already-done tasks.
    ///
    /// # Errors
    ///
    /// Returns [`BuiltinsError::NotFound`] when the session has no such
    /// task.
    pub fn complete(&self, session_id: &str, id: &str) -> Result<TaskItem, BuiltinsError> {
        let mut updated: Option<TaskItem> = None;
        self.mutate(|tasks| {
            let Some(task) = tasks
                .iter_mut()
                .find(|t| t.id == id && t.session_id == session_id)
            else {
                return Err(BuiltinsError::NotFound(id.to_owned()));
            };
            if task.status == TaskItemStatus::Open {
                task.status = TaskItemStatus::Done;
                task.completed_at = Some(Utc::now());
            }
            updated = Some(task.clone());
            Ok(())
        })?;
        updated.ok_or_else(|| BuiltinsError::NotFound(id.to_owned()))
    }

    /// Tasks for a session, newest first, bounded to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read.
    pub fn list(&self, session_id: &str, limit: usize) -> Result<Vec<TaskItem>, BuiltinsError> {
        let mut tasks: Vec<TaskItem> = state::read_json(&self.paths.tasks_index)?
            .unwrap_or_default();
        tasks.retain(|t: &TaskItem| t.session_id == session_id);
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        tasks.truncate(limit.clamp(LIMIT_RANGE.0, LIMIT_RANGE.1));
        Ok(tasks)
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut Vec<TaskItem>) -> Result<(), BuiltinsError>,
    ) -> Result<(), BuiltinsError> {
        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tasks: Vec<TaskItem> =
            state::read_json(&self.paths.tasks_index)?.unwrap_or_default();
        apply(&mut tasks)?;
        state::write_json_atomic(&self.paths.tasks_index, &tasks)?;
        drop(guard);
        Ok(())
    }
}
