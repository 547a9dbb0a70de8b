//! Notification dispatcher: a single polling task draining the store.
//!
//! Every tick reads the pending set (oldest first) and delivers each
//! record through the channel adapter. Delivery errors leave the record
//! pending for the next tick — there is no backoff counter here; flaky
//! channels surface in the logs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{ChannelAdapter, FileDelivery};

use super::{Notification, NotificationKind, NotificationStore};

/// Polling dispatcher for outbound notifications.
pub struct NotificationDispatcher {
    store: Arc<NotificationStore>,
    adapter: Arc<dyn ChannelAdapter>,
    poll_interval_ms: u64,
    active: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher. Nothing runs until [`NotificationDispatcher::start`].
    pub fn new(
        store: Arc<NotificationStore>,
        adapter: Arc<dyn ChannelAdapter>,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            adapter,
            poll_interval_ms,
            active: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the drain loop.
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
        let store = Arc::clone(&self.store);
        let adapter = Arc::clone(&self.adapter);
        let active = Arc::clone(&self.active);
        let poll = self.poll_interval_ms;
        let handle = tokio::spawn(async move {
            debug!("notification dispatcher starting");
            while active.load(Ordering::SeqCst) {
                drain_once(&store, adapter.as_ref()).await;
                tokio::time::sleep(Duration::from_millis(poll)).await;
            }
            debug!("notification dispatcher exited");
        });
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        info!("notification dispatcher started");
    }

    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stop and wait for the drain task.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher task join failed");
            }
        }
    }
}

/// Deliver every pending notification once, sequentially.
///
/// Public within the crate so tests and the reminder flow can force a
/// drain without waiting for the poll interval.
pub(crate) async fn drain_once(store: &NotificationStore, adapter: &dyn ChannelAdapter) {
    let pending = match store.list_pending() {
        Ok(pending) => pending,
        Err(e) => {
            error!(error = %e, "failed to list pending notifications");
            return;
        }
    };

    for notification in pending {
        match deliver(adapter, &notification).await {
            Ok(()) => {
                if let Err(e) = store.mark_delivered(&notification.id) {
                    error!(
                        notification_id = %notification.id,
                        error = %e,
                        "delivered but failed to mark"
                    );
                }
            }
            Err(e) => {
                // Leave pending; the next tick retries.
                warn!(
                    notification_id = %notification.id,
                    session_id = %notification.session_id,
                    error = %e,
                    "delivery failed"
                );
            }
        }
    }
}

async fn deliver(
    adapter: &dyn ChannelAdapter,
    notification: &Notification,
) -> anyhow::Result<()> {
    match notification.kind {
        NotificationKind::Text => {
            let text = notification.text.as_deref().unwrap_or_default();
            adapter.send_text(&notification.session_id, text).await
        }
        NotificationKind::File => {
            let file_path = notification.file_path.as_deref().unwrap_or_default();
            let delivery = FileDelivery {
                file_name: notification.file_name.clone(),
                mime_type: notification.mime_type.clone(),
                caption: notification.caption.clone(),
            };
            adapter
                .send_file(&notification.session_id, Path::new(file_path), &delivery)
                .await
        }
    }
}
