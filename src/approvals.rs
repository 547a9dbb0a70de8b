//! Approval tokens gating privileged actions.
//!
//! When the gateway decides an action needs user confirmation, it stores a
//! pending approval and hands the user a short hex token. The user
//! resolves it with `approve <token>` / `reject <token>`, or with a bare
//! `yes` / `no` that resolves the most recent pending approval for the
//! session. Tokens are single-use (consume deletes) and expire after a
//! TTL; every read prunes expired entries. The whole collection lives in
//! one index file written atomically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::state::{self, StateError, StatePaths};

/// Length of generated approval tokens (hex characters).
const TOKEN_LEN: usize = 8;

/// Hex alphabet used for approval tokens.
const TOKEN_CHARS: &[u8] = b"0123456789abcdef";

/// Default token TTL: 10 minutes.
pub const DEFAULT_TTL_MS: u64 = 600_000;

/// Bounds applied to listing limits.
const LIMIT_RANGE: (usize, usize) = (1, 500);

/// A pending approval bound to one privileged action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalToken {
    /// Short single-use hex token.
    pub token: String,
    /// Session that must resolve the approval.
    pub session_id: String,
    /// Action name the approval authorizes (e.g. `file.write`).
    pub action: String,
    /// Action payload handed to the handler on approval.
    #[serde(default)]
    pub payload: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; expired tokens resolve to nothing.
    pub expires_at: DateTime<Utc>,
}

impl ApprovalToken {
    /// Whether the token has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Errors raised by the approval store.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Index-file store for approval tokens.
#[derive(Debug)]
pub struct ApprovalStore {
    paths: Arc<StatePaths>,
    default_ttl_ms: u64,
    // Serializes read-modify-write cycles on the single index file.
    write_lock: Mutex<()>,
}

impl ApprovalStore {
    /// Create a store with the given default TTL.
    pub fn new(paths: Arc<StatePaths>, default_ttl_ms: u64) -> Self {
        Self {
            paths,
            default_ttl_ms,
            write_lock: Mutex::new(()),
        }
    }

    /// Issue a new approval for `(session_id, action, payload)`.
    ///
    /// The token is a freshly generated hex string, unique among live
    /// entries. `ttl_ms` falls back to the store default when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn create(
        &self,
        session_id: &str,
        action: &str,
        payload: Value,
        ttl_ms: Option<u64>,
    ) -> Result<ApprovalToken, ApprovalError> {
        let guard = self.lock();
        let now = Utc::now();
        let mut entries = self.load_pruned(now)?;

        let mut token = generate_token();
        while entries.iter().any(|e| e.token == token) {
            token = generate_token();
        }

        let ttl_ms = i64::try_from(ttl_ms.unwrap_or(self.default_ttl_ms)).unwrap_or(i64::MAX);
        let expires_at = now
            .checked_add_signed(Duration::milliseconds(ttl_ms))
            .unwrap_or(now);

        let approval = ApprovalToken {
            token,
            session_id: session_id.to_owned(),
            action: action.to_owned(),
            payload,
            created_at: now,
            expires_at,
        };
        entries.push(approval.clone());
        self.save(&entries)?;
        drop(guard);

        debug!(session_id, action, token = %approval.token, "approval created");
        Ok(approval)
    }

    /// Consume the approval matching `(session_id, token)`.
    ///
    /// The entry is removed whenever it is found; an expired entry is
    /// removed *and* resolves to `None` — a second consume always finds
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn consume(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<Option<ApprovalToken>, ApprovalError> {
        self.take(|entries| {
            entries
                .iter()
                .position(|e| e.session_id == session_id && e.token == token)
        })
    }

    /// The most recent pending approval for a session, without consuming.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn peek_latest(&self, session_id: &str) -> Result<Option<ApprovalToken>, ApprovalError> {
        let guard = self.lock();
        let now = Utc::now();
        let entries = self.load_pruned(now)?;
        self.save(&entries)?;
        drop(guard);
        Ok(latest_index(&entries, session_id).map(|i| entries[i].clone()))
    }

    /// Consume the most recent pending approval for a session.
    ///
    /// Backs the bare `yes` flow: one approval resolved per message.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn consume_latest(
        &self,
        session_id: &str,
    ) -> Result<Option<ApprovalToken>, ApprovalError> {
        self.take(|entries| latest_index(entries, session_id))
    }

    /// Discard the most recent pending approval for a session (bare `no`).
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn discard_latest(
        &self,
        session_id: &str,
    ) -> Result<Option<ApprovalToken>, ApprovalError> {
        self.take(|entries| latest_index(entries, session_id))
    }

    /// Pending approvals for a session, newest first, bounded to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn list_by_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ApprovalToken>, ApprovalError> {
        let all = self.list_pending(LIMIT_RANGE.1)?;
        let mut mine: Vec<ApprovalToken> = all
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .collect();
        mine.truncate(limit.clamp(LIMIT_RANGE.0, LIMIT_RANGE.1));
        Ok(mine)
    }

    /// All pending approvals, newest first, bounded to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read or written.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<ApprovalToken>, ApprovalError> {
        let guard = self.lock();
        let now = Utc::now();
        let mut entries = self.load_pruned(now)?;
        self.save(&entries)?;
        drop(guard);

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.token.cmp(&b.token)));
        entries.truncate(limit.clamp(LIMIT_RANGE.0, LIMIT_RANGE.1));
        Ok(entries)
    }

    fn take(
        &self,
        select: impl Fn(&[ApprovalToken]) -> Option<usize>,
    ) -> Result<Option<ApprovalToken>, ApprovalError> {
        let guard = self.lock();
        let now = Utc::now();
        let mut entries = self.load_pruned(now)?;
        let taken = select(&entries).map(|i| entries.remove(i));
        self.save(&entries)?;
        drop(guard);
        Ok(taken.filter(|e| !e.is_expired(now)))
    }

    fn load_pruned(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalToken>, ApprovalError> {
        let mut entries: Vec<ApprovalToken> =
            state::read_json(&self.paths.approvals_index)?.unwrap_or_default();
        let before = entries.len();
        entries.retain(|e| !e.is_expired(now));
        if entries.len() < before {
            debug!(
                pruned = before.saturating_sub(entries.len()),
                "pruned expired approvals"
            );
        }
        Ok(entries)
    }

    fn save(&self, entries: &[ApprovalToken]) -> Result<(), ApprovalError> {
        Ok(state::write_json_atomic(&self.paths.approvals_index, &entries)?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Index of the newest entry for a session.
fn latest_index(entries: &[ApprovalToken], session_id: &str) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.session_id == session_id)
        .max_by_key(|(_, e)| e.created_at)
        .map(|(i, _)| i)
}

/// Generate an 8-character hex token.
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..TOKEN_CHARS.len());
            TOKEN_CHARS[idx] as char
        })
        .collect()
}
