//! Time-based reminders: durable store + polling dispatcher.
//!
//! Reminders live in one index file (`builtins/reminders.json`). The
//! dispatcher polls for due entries, enqueues a text notification
//! (`"Reminder: <text>"`), and only then marks the reminder triggered. A
//! crash between the enqueue and the mark can replay at most one
//! duplicate reminder on the next boot — accepted, and preferred over
//! losing one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::outbound::{NewNotification, NotificationStore};
use crate::state::{self, StateError, StatePaths};

/// Reminder lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    /// Waiting for its due time.
    Pending,
    /// Fired exactly once.
    Triggered,
    /// Cancelled before firing.
    Cancelled,
}

/// A scheduled reminder for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    /// Opaque UUID record id.
    pub id: String,
    /// Session the reminder belongs to.
    pub session_id: String,
    /// Reminder body.
    pub text: String,
    /// When the reminder becomes due.
    pub remind_at: DateTime<Utc>,
    /// Lifecycle state.
    pub status: ReminderStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the reminder fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
}

/// Errors raised by the reminder store.
#[derive(Debug, Error)]
pub enum ReminderError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// `remindAt` was not a parseable timestamp.
    #[error("invalid remindAt timestamp: {0}")]
    InvalidRemindAt(String),
    /// Reminder body was empty.
    #[error("reminder text must not be empty")]
    EmptyText,
    /// No reminder with the given id.
    #[error("reminder not found: {0}")]
    NotFound(String),
}

/// Index-file store for reminders.
#[derive(Debug)]
pub struct ReminderStore {
    paths: Arc<StatePaths>,
    // Serializes read-modify-write cycles on the single index file.
    write_lock: Mutex<()>,
}

impl ReminderStore {
    /// Create a store handle.
    pub fn new(paths: Arc<StatePaths>) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    /// Schedule a reminder. `remind_at` is an ISO-8601 timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ReminderError::InvalidRemindAt`] on an unparseable
    /// timestamp and [`ReminderError::EmptyText`] on a blank body.
    pub fn add(
        &self,
        session_id: &str,
        text: &str,
        remind_at: &str,
    ) -> Result<Reminder, ReminderError> {
        if text.trim().is_empty() {
            return Err(ReminderError::EmptyText);
        }
        let remind_at = DateTime::parse_from_rfc3339(remind_at)
            .map_err(|_| ReminderError::InvalidRemindAt(remind_at.to_owned()))?
            .with_timezone(&Utc);

        let reminder = Reminder {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            text: text.trim().to_owned(),
            remind_at,
            status: ReminderStatus::Pending,
            created_at: Utc::now(),
            triggered_at: None,
        };

        self.mutate(|reminders| {
            reminders.push(reminder.clone());
            Ok(())
        })?;
        debug!(reminder_id = %reminder.id, session_id, "reminder scheduled");
        Ok(reminder)
    }

    /// All reminders for a session, soonest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read.
    pub fn list_by_session(&self, session_id: &str) -> Result<Vec<Reminder>, ReminderError> {
        let mut reminders: Vec<Reminder> = self
            .load()?
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .collect();
        reminders.sort_by(|a, b| a.remind_at.cmp(&b.remind_at));
        Ok(reminders)
    }

    /// Pending reminders whose `remindAt` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>, ReminderError> {
        let mut due: Vec<Reminder> = self
            .load()?
            .into_iter()
            .filter(|r| r.status == ReminderStatus::Pending && r.remind_at <= now)
            .collect();
        due.sort_by(|a, b| a.remind_at.cmp(&b.remind_at));
        Ok(due)
    }

    /// Mark a reminder triggered. Exactly-once: a reminder that is not
    /// `pending` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ReminderError::NotFound`] for an unknown id.
    pub fn mark_triggered(&self, id: &str) -> Result<Reminder, ReminderError> {
        self.transition(id, ReminderStatus::Triggered)
    }

    /// Cancel a pending reminder.
    ///
    /// # Errors
    ///
    /// Returns [`ReminderError::NotFound`] for an unknown id.
    pub fn cancel(&self, id: &str) -> Result<Reminder, ReminderError> {
        self.transition(id, ReminderStatus::Cancelled)
    }

    fn transition(&self, id: &str, to: ReminderStatus) -> Result<Reminder, ReminderError> {
        let mut updated: Option<Reminder> = None;
        self.mutate(|reminders| {
            let Some(reminder) = reminders.iter_mut().find(|r| r.id == id) else {
                return Err(ReminderError::NotFound(id.to_owned()));
            };
            if reminder.status == ReminderStatus::Pending {
                reminder.status = to;
                if to == ReminderStatus::Triggered {
                    reminder.triggered_at = Some(Utc::now());
                }
            }
            updated = Some(reminder.clone());
            Ok(())
        })?;
        updated.ok_or_else(|| ReminderError::NotFound(id.to_owned()))
    }

    fn load(&self) -> Result<Vec<Reminder>, ReminderError> {
        Ok(state::read_json(&self.paths.reminders_index)?.unwrap_or_default())
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut Vec<Reminder>) -> Result<(), ReminderError>,
    ) -> Result<(), ReminderError> {
        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut reminders = self.load()?;
        apply(&mut reminders)?;
        state::write_json_atomic(&self.paths.reminders_index, &reminders)?;
        drop(guard);
        Ok(())
    }
}

/// Polling dispatcher that turns due reminders into notifications.
pub struct ReminderDispatcher {
    store: Arc<ReminderStore>,
    notifications: Arc<NotificationStore>,
    poll_interval_ms: u64,
    active: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReminderDispatcher {
    /// Create a dispatcher. Nothing runs until [`ReminderDispatcher::start`].
    pub fn new(
        store: Arc<ReminderStore>,
        notifications: Arc<NotificationStore>,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            notifications,
            poll_interval_ms,
            active: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the poll loop.
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
        let store = Arc::clone(&self.store);
        let notifications = Arc::clone(&self.notifications);
        let active = Arc::clone(&self.active);
        let poll = self.poll_interval_ms;
        let handle = tokio::spawn(async move {
            debug!("reminder dispatcher starting");
            while active.load(Ordering::SeqCst) {
                trigger_due(&store, &notifications, Utc::now());
                tokio::time::sleep(Duration::from_millis(poll)).await;
            }
            debug!("reminder dispatcher exited");
        });
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        info!("reminder dispatcher started");
    }

    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stop and wait for the poll task.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "reminder dispatcher join failed");
            }
        }
    }
}

/// Enqueue a notification for every due reminder, then mark it triggered.
///
/// The mark happens strictly after a successful enqueue: a crash in
/// between replays the reminder once on the next boot.
pub(crate) fn trigger_due(
    store: &ReminderStore,
    notifications: &NotificationStore,
    now: DateTime<Utc>,
) {
    let due = match store.list_due(now) {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "failed to list due reminders");
            return;
        }
    };

    for reminder in due {
        let params = NewNotification::text(
            reminder.session_id.clone(),
            format!("Reminder: {}", reminder.text),
        );
        match notifications.enqueue(params) {
            Ok(_) => {
                if let Err(e) = store.mark_triggered(&reminder.id) {
                    error!(reminder_id = %reminder.id, error = %e, "failed to mark triggered");
                }
            }
            Err(e) => {
                warn!(reminder_id = %reminder.id, error = %e, "failed to enqueue reminder");
            }
        }
    }
}
