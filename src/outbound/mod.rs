//! Outbound notifications: durable queue + polling dispatcher.
//!
//! A [`Notification`] is either a text message or a file attachment bound
//! for a chat session. Records are one JSON file each under
//! `notifications/`; the dispatcher drains undelivered records oldest
//! first through a [`crate::adapters::ChannelAdapter`] and stamps
//! `deliveredAt` on success. Per-session FIFO follows from the
//! `createdAt` sort and the single sequential drain task.

pub mod dispatcher;

pub use dispatcher::NotificationDispatcher;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::state::{self, StateError, StatePaths};

/// Notification payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Plain text message.
    Text,
    /// File attachment with optional caption.
    File,
}

/// Durable outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Opaque UUID record id.
    pub id: String,
    /// Target chat session.
    pub session_id: String,
    /// Payload kind; decides which of `text` / `filePath` is required.
    pub kind: NotificationKind,
    /// Message body (`kind = text`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attachment path (`kind = file`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Attachment display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Attachment MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Attachment caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Job this notification was produced by, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Job status carried for context (e.g. `succeeded`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Enqueue time; the dispatcher's sort key.
    pub created_at: DateTime<Utc>,
    /// Delivery time, set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Parameters for enqueueing a notification.
#[derive(Debug, Clone, Default)]
pub struct NewNotification {
    /// Target chat session.
    pub session_id: String,
    /// Message body for text notifications.
    pub text: Option<String>,
    /// Attachment path for file notifications.
    pub file_path: Option<String>,
    /// Attachment display name.
    pub file_name: Option<String>,
    /// Attachment MIME type.
    pub mime_type: Option<String>,
    /// Attachment caption.
    pub caption: Option<String>,
    /// Originating job, when any.
    pub job_id: Option<String>,
    /// Job status carried for context.
    pub status: Option<String>,
}

impl NewNotification {
    /// Text notification for a session.
    pub fn text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// File notification for a session.
    pub fn file(session_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            file_path: Some(file_path.into()),
            ..Self::default()
        }
    }
}

/// Errors raised by the notification store.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// A text notification needs a non-empty `text`.
    #[error("notification_text_required")]
    TextRequired,
    /// A file notification needs a non-empty `filePath`.
    #[error("notification_file_path_required")]
    FilePathRequired,
    /// No notification record with the given id.
    #[error("notification not found: {0}")]
    NotFound(String),
}

/// Durable notification store over the state directory.
#[derive(Debug)]
pub struct NotificationStore {
    paths: Arc<StatePaths>,
}

impl NotificationStore {
    /// Create a store handle.
    pub fn new(paths: Arc<StatePaths>) -> Self {
        Self { paths }
    }

    /// Validate and persist a new notification.
    ///
    /// Exactly one of `text` (non-empty) or `filePath` (non-empty) must be
    /// present, matching the declared kind.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::TextRequired`] /
    /// [`NotificationError::FilePathRequired`] on a malformed payload.
    pub fn enqueue(&self, params: NewNotification) -> Result<Notification, NotificationError> {
        let text = params.text.filter(|t| !t.trim().is_empty());
        let file_path = params.file_path.filter(|p| !p.trim().is_empty());

        let kind = match (&text, &file_path) {
            (Some(_), None) => NotificationKind::Text,
            (None, Some(_)) => NotificationKind::File,
            // Exactly one of text / filePath: nothing or both is malformed.
            (None, None) => return Err(NotificationError::TextRequired),
            (Some(_), Some(_)) => return Err(NotificationError::FilePathRequired),
        };

        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            session_id: params.session_id,
            kind,
            text,
            file_path,
            file_name: params.file_name,
            mime_type: params.mime_type,
            caption: params.caption,
            job_id: params.job_id,
            status: params.status,
            created_at: Utc::now(),
            delivered_at: None,
        };
        state::write_json_atomic(
            &self.paths.notification_file(&notification.id),
            &notification,
        )?;
        debug!(
            notification_id = %notification.id,
            session_id = %notification.session_id,
            "notification enqueued"
        );
        Ok(notification)
    }

    /// Load one notification by id.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure or a corrupt record.
    pub fn get(&self, id: &str) -> Result<Option<Notification>, NotificationError> {
        Ok(state::read_json(&self.paths.notification_file(id))?)
    }

    /// Undelivered notifications, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be read.
    pub fn list_pending(&self) -> Result<Vec<Notification>, NotificationError> {
        let mut pending: Vec<Notification> = self
            .load_all()?
            .into_iter()
            .filter(|n| n.delivered_at.is_none())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    /// Stamp `deliveredAt`. Idempotent: an already-delivered record keeps
    /// its original timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::NotFound`] for an unknown id.
    pub fn mark_delivered(&self, id: &str) -> Result<Notification, NotificationError> {
        let mut notification = self
            .get(id)?
            .ok_or_else(|| NotificationError::NotFound(id.to_owned()))?;
        if notification.delivered_at.is_none() {
            notification.delivered_at = Some(Utc::now());
            state::write_json_atomic(&self.paths.notification_file(id), &notification)?;
        }
        Ok(notification)
    }

    fn load_all(&self) -> Result<Vec<Notification>, NotificationError> {
        let mut notifications = Vec::new();
        for path in state::list_record_files(&self.paths.notifications_dir)? {
            if let Some(n) = state::read_json::<Notification>(&path)? {
                notifications.push(n);
            }
        }
        Ok(notifications)
    }
}
