//! Inbound dedupe store: short-TTL fingerprints for webhook deliveries.
//!
//! Chat webhooks redeliver. Each inbound message is fingerprinted with a
//! channel-specific composite key (`baileys:<remoteJid>:<messageId>`) and
//! checked against a persisted set so duplicates are dropped even across
//! a restart. Entries older than the window are evicted on every call.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::state::{self, StateError, StatePaths};

/// Errors raised by the dedupe store.
#[derive(Debug, Error)]
pub enum DedupeError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Persistent fingerprint set with a bounded retention window.
#[derive(Debug)]
pub struct DedupeStore {
    paths: Arc<StatePaths>,
    window_ms: i64,
    write_lock: Mutex<()>,
}

impl DedupeStore {
    /// Create a store evicting fingerprints older than `window_ms`.
    pub fn new(paths: Arc<StatePaths>, window_ms: u64) -> Self {
        Self {
            paths,
            window_ms: i64::try_from(window_ms).unwrap_or(i64::MAX),
            write_lock: Mutex::new(()),
        }
    }

    /// Compose the fingerprint key for a Baileys-style webhook message.
    pub fn baileys_key(remote_jid: &str, message_id: &str) -> String {
        format!("baileys:{remote_jid}:{message_id}")
    }

    /// Check-and-mark in one step.
    ///
    /// Returns `true` when the key was already present inside the window
    /// (a duplicate); otherwise inserts it and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn is_duplicate_and_mark(&self, key: &str) -> Result<bool, DedupeError> {
        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Utc::now();
        let mut fingerprints: BTreeMap<String, DateTime<Utc>> =
            state::read_json(&self.paths.dedupe_index)?.unwrap_or_default();

        let before = fingerprints.len();
        fingerprints.retain(|_, seen_at| {
            now.signed_duration_since(*seen_at).num_milliseconds() <= self.window_ms
        });
        if fingerprints.len() < before {
            debug!(
                evicted = before.saturating_sub(fingerprints.len()),
                "evicted expired dedupe fingerprints"
            );
        }

        let duplicate = fingerprints.contains_key(key);
        if !duplicate {
            fingerprints.insert(key.to_owned(), now);
        }
        state::write_json_atomic(&self.paths.dedupe_index, &fingerprints)?;
        drop(guard);
        Ok(duplicate)
    }
}
