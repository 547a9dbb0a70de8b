//! Console adapter: logs deliveries instead of sending them anywhere.
//!
//! The default adapter when no real channel is wired up, and the test
//! double of choice (it records every delivery it sees).

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::{ChannelAdapter, FileDelivery};

/// One delivery observed by the console adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleDelivery {
    /// A text message.
    Text {
        /// Target session.
        session_id: String,
        /// Message body.
        text: String,
    },
    /// A file attachment.
    File {
        /// Target session.
        session_id: String,
        /// Path of the attached file.
        file_path: String,
        /// Display name, when provided.
        file_name: Option<String>,
    },
}

/// Adapter that logs deliveries and keeps them for inspection.
#[derive(Debug, Default)]
pub struct ConsoleAdapter {
    deliveries: Mutex<Vec<ConsoleDelivery>>,
}

impl ConsoleAdapter {
    /// Create an empty console adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    pub fn deliveries(&self) -> Vec<ConsoleDelivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn record(&self, delivery: ConsoleDelivery) {
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(delivery);
        }
    }
}

#[async_trait]
impl ChannelAdapter for ConsoleAdapter {
    async fn send_text(&self, session_id: &str, text: &str) -> anyhow::Result<()> {
        info!(session_id, text, "console delivery (text)");
        self.record(ConsoleDelivery::Text {
            session_id: session_id.to_owned(),
            text: text.to_owned(),
        });
        Ok(())
    }

    async fn send_file(
        &self,
        session_id: &str,
        file_path: &Path,
        delivery: &FileDelivery,
    ) -> anyhow::Result<()> {
        info!(
            session_id,
            file = %file_path.display(),
            file_name = delivery.file_name.as_deref().unwrap_or(""),
            "console delivery (file)"
        );
        self.record(ConsoleDelivery::File {
            session_id: session_id.to_owned(),
            file_path: file_path.display().to_string(),
            file_name: delivery.file_name.clone(),
        });
        Ok(())
    }
}
