//! Conversation event log: append, query, and live subscriptions.
//!
//! Every inbound message, outbound reply, and job status change lands
//! here as a [`ConversationEvent`]. Events are journaled to the
//! append-only `events.jsonl` and mirrored into a bounded in-memory ring
//! that backs queries and the SSE stream. Subscribers receive events
//! synchronously at append time through bounded queues; a slow consumer
//! drops events rather than blocking the writer.
//!
//! Near-duplicate suppression: within a small window, an event with the
//! same `(sessionId, direction, kind, text)` as a ring entry is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::EventJournal;

/// Journal line tag for conversation events.
const JOURNAL_TYPE: &str = "conversation.event";

/// Per-subscriber queue capacity; overflow drops events for that
/// subscriber only.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Bounds applied to query limits.
const LIMIT_RANGE: (usize, usize) = (1, 500);

/// One observable event in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    /// Opaque UUID record id.
    pub id: String,
    /// Session the event belongs to.
    pub session_id: String,
    /// Producing component (`gateway`, `worker`, `reminder`, ...).
    pub source: String,
    /// Channel the event relates to (`http`, `baileys`, ...).
    pub channel: String,
    /// `inbound` or `outbound`.
    pub direction: String,
    /// Event kind (`message`, `job_status`, `approval`, ...).
    pub kind: String,
    /// Event text.
    pub text: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Parameters for appending an event.
#[derive(Debug, Clone)]
pub struct NewConversationEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Producing component.
    pub source: String,
    /// Channel the event relates to.
    pub channel: String,
    /// `inbound` or `outbound`.
    pub direction: String,
    /// Event kind.
    pub kind: String,
    /// Event text.
    pub text: String,
    /// Free-form metadata.
    pub metadata: Value,
}

/// Query filter for the event log. Empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Restrict to one session.
    pub session_id: Option<String>,
    /// Restrict to these kinds.
    pub kinds: Vec<String>,
    /// Restrict to these sources.
    pub sources: Vec<String>,
    /// Restrict to these channels.
    pub channels: Vec<String>,
    /// Restrict to these directions.
    pub directions: Vec<String>,
    /// Case-insensitive substring on `text`.
    pub text: Option<String>,
    /// Only events at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only events at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Maximum results, clamped to `[1, 500]`.
    pub limit: Option<usize>,
}

/// Retention and dedupe knobs for the log.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Minimum number of events kept in the ring.
    pub max_events: usize,
    /// Events older than this many days are pruned.
    pub retention_days: u32,
    /// Dedupe window in milliseconds.
    pub dedupe_window_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_events: 5_000,
            retention_days: 14,
            dedupe_window_ms: 2_500,
        }
    }
}

/// Live subscription handle. Drop the receiver (or call
/// [`ConversationLog::unsubscribe`]) to detach.
pub struct EventSubscription {
    /// Subscriber id for explicit unsubscription.
    pub id: u64,
    /// Receiving end of the subscriber queue.
    pub rx: mpsc::Receiver<ConversationEvent>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ConversationEvent>,
}

struct Inner {
    ring: VecDeque<ConversationEvent>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Append-and-query conversation log with live fanout.
pub struct ConversationLog {
    config: StreamConfig,
    journal: Arc<EventJournal>,
    inner: Mutex<Inner>,
}

impl ConversationLog {
    /// Create a log, replaying the journal tail into the ring so queries
    /// and dedupe survive a restart.
    pub fn new(journal: Arc<EventJournal>, config: StreamConfig) -> Self {
        let mut ring = VecDeque::new();
        match journal.tail(config.max_events) {
            Ok(lines) => {
                for line in lines {
                    if line.get("type").and_then(Value::as_str) != Some(JOURNAL_TYPE) {
                        continue;
                    }
                    match serde_json::from_value::<ConversationEvent>(
                        line.get("event").cloned().unwrap_or(Value::Null),
                    ) {
                        Ok(event) => ring.push_back(event),
                        Err(e) => debug!(error = %e, "skipping unreadable journaled event"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "event journal replay failed"),
        }
        debug!(replayed = ring.len(), "conversation log ready");

        Self {
            config,
            journal,
            inner: Mutex::new(Inner {
                ring,
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            }),
        }
    }

    /// Append an event, journal it, and push it to every subscriber.
    ///
    /// Returns `None` when the event was suppressed as a near-duplicate.
    pub fn add(&self, params: NewConversationEvent) -> Option<ConversationEvent> {
        let event = ConversationEvent {
            id: Uuid::new_v4().to_string(),
            session_id: params.session_id,
            source: params.source,
            channel: params.channel,
            direction: params.direction,
            kind: params.kind,
            text: params.text,
            created_at: Utc::now(),
            metadata: params.metadata,
        };

        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.is_duplicate(&inner.ring, &event) {
            debug!(session_id = %event.session_id, kind = %event.kind, "suppressing duplicate event");
            return None;
        }

        inner.ring.push_back(event.clone());
        prune_ring(&mut inner.ring, &self.config, Utc::now());

        // Synchronous fanout, non-blocking per subscriber: a full queue
        // drops this event for that subscriber, a closed one detaches.
        inner.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = subscriber.id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        drop(inner);

        let line = serde_json::json!({
            "type": JOURNAL_TYPE,
            "event": event,
        });
        if let Err(e) = self.journal.append(&line) {
            warn!(error = %e, "failed to journal conversation event");
        }

        Some(event)
    }

    /// Query the ring, newest first, bounded to the clamped limit.
    pub fn query(&self, filter: &EventQuery) -> Vec<ConversationEvent> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let text_needle = filter.text.as_ref().map(|t| t.to_lowercase());
        let mut matched: Vec<ConversationEvent> = inner
            .ring
            .iter()
            .rev()
            .filter(|e| {
                filter
                    .session_id
                    .as_ref()
                    .map_or(true, |s| &e.session_id == s)
                    && member_or_empty(&filter.kinds, &e.kind)
                    && member_or_empty(&filter.sources, &e.source)
                    && member_or_empty(&filter.channels, &e.channel)
                    && member_or_empty(&filter.directions, &e.direction)
                    && text_needle
                        .as_ref()
                        .map_or(true, |needle| e.text.to_lowercase().contains(needle))
                    && filter.since.map_or(true, |since| e.created_at >= since)
                    && filter.until.map_or(true, |until| e.created_at <= until)
            })
            .cloned()
            .collect();

        let limit = filter
            .limit
            .unwrap_or(LIMIT_RANGE.1)
            .clamp(LIMIT_RANGE.0, LIMIT_RANGE.1);
        matched.truncate(limit);
        matched
    }

    /// Register a live subscriber.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id = inner.next_subscriber_id.saturating_add(1);
        inner.subscribers.push(Subscriber { id, tx });
        debug!(subscriber = id, "subscriber registered");
        EventSubscription { id, rx }
    }

    /// Detach a subscriber by id.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Apply retention to the ring.
    pub fn prune_now(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        prune_ring(&mut inner.ring, &self.config, Utc::now());
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.ring.len())
            .unwrap_or(0)
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_duplicate(&self, ring: &VecDeque<ConversationEvent>, event: &ConversationEvent) -> bool {
        if self.config.dedupe_window_ms == 0 {
            return false;
        }
        let window = Duration::milliseconds(
            i64::try_from(self.config.dedupe_window_ms).unwrap_or(i64::MAX),
        );
        ring.iter().rev().take_while(|existing| {
            event
                .created_at
                .signed_duration_since(existing.created_at)
                <= window
        })
        .any(|existing| {
            existing.session_id == event.session_id
                && existing.direction == event.direction
                && existing.kind == event.kind
                && existing.text == event.text
        })
    }
}

fn member_or_empty(set: &[String], value: &str) -> bool {
    set.is_empty() || set.iter().any(|s| s == value)
}

fn prune_ring(ring: &mut VecDeque<ConversationEvent>, config: &StreamConfig, now: DateTime<Utc>) {
    let cutoff = now
        .checked_sub_signed(Duration::days(i64::from(config.retention_days)))
        .unwrap_or(now);
    while let Some(front) = ring.front() {
        let over_capacity = ring.len() > config.max_events;
        let expired = front.created_at < cutoff;
        if over_capacity || expired {
            ring.pop_front();
        } else {
            break;
        }
    }
}
