//! HTTP surface: versioned JSON API plus an SSE event stream.
//!
//! Handlers translate between wire payloads and the facade/stores and map
//! structured errors onto status codes. They never touch core state on a
//! validation failure.

mod routes;
mod sse;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::approvals::ApprovalStore;
use crate::builtins::{NoteStore, TaskItemStore};
use crate::events::ConversationLog;
use crate::gateway::Gateway;
use crate::jobs::JobStore;
use crate::reminders::ReminderStore;
use crate::runspec::RunSpecStore;

/// Service name advertised on the health endpoint.
pub const SERVICE_NAME: &str = "straylight";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Facade for inbound messages.
    pub gateway: Arc<Gateway>,
    /// Job store for direct job routes.
    pub jobs: Arc<JobStore>,
    /// Approval store for the pending listing.
    pub approvals: Arc<ApprovalStore>,
    /// Run-spec store for run routes.
    pub runs: Arc<RunSpecStore>,
    /// Conversation log for queries and SSE.
    pub conversation: Arc<ConversationLog>,
    /// Notes store.
    pub notes: Arc<NoteStore>,
    /// Task item store.
    pub tasks: Arc<TaskItemStore>,
    /// Reminder store.
    pub reminders: Arc<ReminderStore>,
    /// Shared secret required on the Baileys webhook, when configured.
    pub baileys_inbound_token: Option<String>,
}

/// Build the full API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages/inbound", post(routes::inbound_message))
        .route("/v1/whatsapp/baileys/inbound", post(routes::baileys_inbound))
        .route("/v1/jobs", post(routes::create_job).get(routes::list_jobs))
        .route("/v1/jobs/:id", get(routes::get_job))
        .route("/v1/jobs/:id/receipt", get(routes::get_receipt))
        .route("/v1/jobs/:id/cancel", post(routes::cancel_job))
        .route("/v1/jobs/:id/retry", post(routes::retry_job))
        .route("/v1/approvals/pending", get(routes::pending_approvals))
        .route("/v1/approvals/resolve", post(routes::resolve_approval))
        .route("/v1/runs", get(routes::list_runs))
        .route("/v1/runs/:run_id", get(routes::get_run))
        .route("/v1/stream/events", get(routes::query_events))
        .route("/v1/stream/events/subscribe", get(sse::subscribe_events))
        .route("/v1/notes", post(routes::add_note).get(routes::list_notes))
        .route("/v1/tasks", post(routes::add_task).get(routes::list_tasks))
        .route("/v1/tasks/:id/complete", post(routes::complete_task))
        .route("/v1/reminders", post(routes::add_reminder).get(routes::list_reminders))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build a `{error, message}` response with the given status.
pub(crate) fn error_response(
    status: StatusCode,
    error: &str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Map an internal failure onto a 500 without leaking details.
pub(crate) fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, context, "internal error");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        context.to_owned(),
    )
}
