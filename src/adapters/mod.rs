//! Outbound channel adapters.
//!
//! The dispatcher delivers notifications through a [`ChannelAdapter`];
//! real chat channels (WhatsApp link manager, dashboards) live outside
//! this crate and implement the trait. [`console::ConsoleAdapter`] ships
//! for development and tests.

pub mod console;

use std::path::Path;

use async_trait::async_trait;

/// Attachment metadata accompanying a file delivery.
#[derive(Debug, Clone, Default)]
pub struct FileDelivery {
    /// Display name for the attachment.
    pub file_name: Option<String>,
    /// MIME type of the attachment.
    pub mime_type: Option<String>,
    /// Caption rendered alongside the attachment.
    pub caption: Option<String>,
}

/// Delivery seam between the notification dispatcher and a chat channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Deliver a text message to a session.
    async fn send_text(&self, session_id: &str, text: &str) -> anyhow::Result<()>;

    /// Deliver a file attachment to a session.
    async fn send_file(
        &self,
        session_id: &str,
        file_path: &Path,
        delivery: &FileDelivery,
    ) -> anyhow::Result<()>;
}
