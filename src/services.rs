//! Collaborator interfaces consumed by the gateway.
//!
//! Real implementations (model providers, web search, memory index) live
//! outside this crate; the core only depends on these seams. When no
//! [`LlmService`] is configured the gateway falls back to a deterministic
//! echo reply, which keeps development and tests hermetic.

use async_trait::async_trait;

/// Text-generation collaborator backing in-line chat replies.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Produce a reply for `input` in the context of `session_id`.
    ///
    /// Returning `Ok(None)` means the provider declined (no model
    /// configured, empty completion); the gateway then uses its fallback.
    async fn generate_text(&self, session_id: &str, input: &str)
        -> anyhow::Result<Option<String>>;
}

/// Action handler invoked when a user approves a privileged action.
///
/// Registered per action name on the gateway; receives the approval's
/// payload and returns a short acknowledgement for the user.
#[async_trait]
pub trait ApprovalAction: Send + Sync {
    /// Execute the approved action.
    async fn run(&self, session_id: &str, payload: &serde_json::Value)
        -> anyhow::Result<String>;
}
