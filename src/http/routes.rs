//! JSON route handlers.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::events::EventQuery;
use crate::gateway::{BaileysOutcome, GatewayError, GatewayResponse, InboundMessage};
use crate::jobs::{CreateJob, JobStoreError};

use super::{error_response, internal_error, AppState, SERVICE_NAME};

/// Header carrying the Baileys webhook shared secret.
const BAILEYS_TOKEN_HEADER: &str = "x-baileys-inbound-token";

/// Default priority for jobs created through the jobs route.
const DEFAULT_JOB_PRIORITY: i64 = 5;

// ── Inbound messages ────────────────────────────────────────────

/// `POST /v1/messages/inbound`
pub(super) async fn inbound_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let session_id = body.get("sessionId").and_then(Value::as_str).unwrap_or("");
    let text = body.get("text").and_then(Value::as_str).unwrap_or("");
    let request_job = body
        .get("requestJob")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let metadata = body.get("metadata").cloned().unwrap_or(Value::Null);

    let message = InboundMessage {
        session_id: session_id.to_owned(),
        text: text.to_owned(),
        request_job,
        metadata,
        channel: "http".to_owned(),
    };

    match state.gateway.handle_inbound(message).await {
        Ok(response) => gateway_response(response, None),
        Err(GatewayError::InvalidInbound(message)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_inbound_message", message)
        }
        Err(e) => internal_error("inbound message failed", e),
    }
}

/// `POST /v1/whatsapp/baileys/inbound`
pub(super) async fn baileys_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(expected) = &state.baileys_inbound_token {
        let presented = headers
            .get(BAILEYS_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != expected {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized_baileys_inbound",
                "webhook token mismatch",
            );
        }
    }

    match state.gateway.handle_baileys(&body).await {
        Ok(BaileysOutcome {
            duplicate: true, ..
        }) => (StatusCode::OK, Json(json!({ "duplicate": true }))).into_response(),
        Ok(BaileysOutcome {
            response: Some(response),
            ..
        }) => gateway_response(response, Some(false)),
        Ok(BaileysOutcome { response: None, .. }) => {
            internal_error("baileys outcome missing response", "empty pipeline result")
        }
        Err(GatewayError::InvalidBaileys(message)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_baileys_inbound", message)
        }
        Err(e) => internal_error("baileys inbound failed", e),
    }
}

/// Serialize a facade response with the documented status codes.
fn gateway_response(response: GatewayResponse, duplicate: Option<bool>) -> Response {
    let with_duplicate = |mut value: Value| {
        if let (Some(duplicate), Some(map)) = (duplicate, value.as_object_mut()) {
            map.insert("duplicate".to_owned(), Value::Bool(duplicate));
        }
        value
    };

    match response {
        GatewayResponse::Chat { response } => (
            StatusCode::OK,
            Json(with_duplicate(json!({ "mode": "chat", "response": response }))),
        )
            .into_response(),
        GatewayResponse::AsyncJob { job_id } => (
            StatusCode::ACCEPTED,
            Json(with_duplicate(json!({ "mode": "async-job", "jobId": job_id }))),
        )
            .into_response(),
        GatewayResponse::Approval {
            decision,
            resolved,
            action,
            token,
            detail,
        } => (
            StatusCode::OK,
            Json(with_duplicate(json!({
                "mode": "approval",
                "decision": decision,
                "resolved": resolved,
                "action": action,
                "token": token,
                "detail": detail,
            }))),
        )
            .into_response(),
        GatewayResponse::StepApproval { run_id, step_id } => (
            StatusCode::OK,
            Json(with_duplicate(json!({
                "mode": "step-approval",
                "runId": run_id,
                "stepId": step_id,
            }))),
        )
            .into_response(),
    }
}

// ── Jobs ────────────────────────────────────────────────────────

/// `POST /v1/jobs`
pub(super) async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let job_type = body
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("stub_task")
        .trim()
        .to_owned();
    if job_type.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_job_request",
            "type must not be empty",
        );
    }
    let payload = match body.get("payload") {
        None | Some(Value::Null) => json!({}),
        Some(payload) if payload.is_object() => payload.clone(),
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_job_request",
                "payload must be an object",
            )
        }
    };
    let priority = body
        .get("priority")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_JOB_PRIORITY);
    let requested_skill = body
        .get("requestedSkill")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match state.jobs.create_job(CreateJob {
        job_type,
        payload,
        priority,
        requested_skill,
    }) {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(json!({ "jobId": job.id, "status": job.status })),
        )
            .into_response(),
        Err(e) => internal_error("job creation failed", e),
    }
}

/// `GET /v1/jobs`
pub(super) async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = parse_limit(&params);
    match state.jobs.list_jobs(limit) {
        Ok(jobs) => (
            StatusCode::OK,
            Json(json!({ "count": jobs.len(), "jobs": jobs })),
        )
            .into_response(),
        Err(e) => internal_error("job listing failed", e),
    }
}

/// `GET /v1/jobs/:id`
pub(super) async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.jobs.get_job(&id) {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => job_not_found(&id),
        Err(e) => internal_error("job lookup failed", e),
    }
}

/// `GET /v1/jobs/:id/receipt`
pub(super) async fn get_receipt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.jobs.get_receipt(&id) {
        Ok(Some(receipt)) => (StatusCode::OK, Json(receipt)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "job_not_found",
            format!("no receipt for job {id}"),
        ),
        Err(e) => internal_error("receipt lookup failed", e),
    }
}

/// `POST /v1/jobs/:id/cancel`
pub(super) async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.jobs.cancel_job(&id) {
        Ok(Some(job)) => (
            StatusCode::OK,
            Json(json!({ "jobId": job.id, "status": job.status })),
        )
            .into_response(),
        Ok(None) => job_not_found(&id),
        Err(e) => internal_error("job cancel failed", e),
    }
}

/// `POST /v1/jobs/:id/retry`
pub(super) async fn retry_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.jobs.retry_job(&id) {
        Ok(child) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "jobId": child.id,
                "status": child.status,
                "retryOf": child.retry_of,
            })),
        )
            .into_response(),
        Err(JobStoreError::NotFound(_)) => job_not_found(&id),
        Err(JobStoreError::RetryUnavailable(id, status)) => error_response(
            StatusCode::CONFLICT,
            "job_retry_unavailable",
            format!("job {id} is {status}; only failed or cancelled jobs can be retried"),
        ),
        Err(e) => internal_error("job retry failed", e),
    }
}

fn job_not_found(id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "job_not_found",
        format!("no job {id}"),
    )
}

// ── Approvals ───────────────────────────────────────────────────

/// `GET /v1/approvals/pending`
pub(super) async fn pending_approvals(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session_id) = params.get("sessionId").filter(|s| !s.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_approvals_query",
            "sessionId is required",
        );
    };
    let limit = parse_limit(&params);

    match state.approvals.list_by_session(session_id, limit) {
        Ok(pending) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": session_id,
                "count": pending.len(),
                "pending": pending,
            })),
        )
            .into_response(),
        Err(e) => internal_error("approvals listing failed", e),
    }
}

/// `POST /v1/approvals/resolve`
///
/// Synthesizes the chat command for the decision and runs it through the
/// facade, so the API and the chat channel resolve approvals identically.
pub(super) async fn resolve_approval(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let session_id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    let decision = body
        .get("decision")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let token = body
        .get("token")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty());

    if session_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_approval_resolve_request",
            "sessionId is required",
        );
    }
    let verb = match decision.as_str() {
        "approve" => "approve",
        "reject" => "reject",
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_approval_resolve_request",
                "decision must be approve or reject",
            )
        }
    };

    let text = match token {
        Some(token) => format!("{verb} {token}"),
        None => verb.to_owned(),
    };
    let message = InboundMessage {
        session_id: session_id.to_owned(),
        text,
        request_job: false,
        metadata: Value::Null,
        channel: "http-api".to_owned(),
    };

    match state.gateway.handle_inbound(message).await {
        Ok(response) => gateway_response(response, None),
        Err(GatewayError::InvalidInbound(message)) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_approval_resolve_request",
            message,
        ),
        Err(e) => internal_error("approval resolve failed", e),
    }
}

// ── Runs ────────────────────────────────────────────────────────

/// `GET /v1/runs/:run_id`
pub(super) async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.runs.get(&run_id) {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "run_not_found",
            format!("no run {run_id}"),
        ),
        Err(e) => internal_error("run lookup failed", e),
    }
}

/// `GET /v1/runs?sessionKey=&limit=`
pub(super) async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session_key) = params.get("sessionKey").filter(|s| !s.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_runs_query",
            "sessionKey is required",
        );
    };
    let limit = parse_limit(&params);

    match state.runs.list_by_session(session_key, limit) {
        Ok(runs) => (
            StatusCode::OK,
            Json(json!({ "count": runs.len(), "runs": runs })),
        )
            .into_response(),
        Err(e) => internal_error("run listing failed", e),
    }
}

// ── Event stream ────────────────────────────────────────────────

/// `GET /v1/stream/events`
pub(super) async fn query_events(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filter = EventQuery {
        session_id: params.get("sessionId").cloned(),
        kinds: split_csv(params.get("kinds")),
        sources: split_csv(params.get("sources")),
        channels: split_csv(params.get("channels")),
        directions: split_csv(params.get("directions")),
        text: params.get("text").cloned(),
        since: parse_time(params.get("since")),
        until: parse_time(params.get("until")),
        limit: params.get("limit").and_then(|l| l.parse().ok()),
    };

    let events = state.conversation.query(&filter);
    (
        StatusCode::OK,
        Json(json!({ "count": events.len(), "events": events })),
    )
        .into_response()
}

// ── Notes / tasks / reminders ───────────────────────────────────

/// `POST /v1/notes`
pub(super) async fn add_note(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (session_id, text) = match session_and_text(&body) {
        Ok(pair) => pair,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_note_payload", message)
        }
    };
    match state.notes.add(session_id, text) {
        Ok(note) => (StatusCode::CREATED, Json(note)).into_response(),
        Err(crate::builtins::BuiltinsError::EmptyText) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_note_payload",
            "text must not be empty",
        ),
        Err(e) => internal_error("note creation failed", e),
    }
}

/// `GET /v1/notes?sessionId=&limit=`
pub(super) async fn list_notes(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session_id) = params.get("sessionId").filter(|s| !s.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_note_payload",
            "sessionId is required",
        );
    };
    match state.notes.list(session_id, parse_limit(&params)) {
        Ok(notes) => (
            StatusCode::OK,
            Json(json!({ "count": notes.len(), "notes": notes })),
        )
            .into_response(),
        Err(e) => internal_error("note listing failed", e),
    }
}

/// `POST /v1/tasks`
pub(super) async fn add_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (session_id, text) = match session_and_text(&body) {
        Ok(pair) => pair,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_note_payload", message)
        }
    };
    match state.tasks.add(session_id, text) {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(crate::builtins::BuiltinsError::EmptyText) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_note_payload",
            "text must not be empty",
        ),
        Err(e) => internal_error("task creation failed", e),
    }
}

/// `POST /v1/tasks/:id/complete`
pub(super) async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let session_id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    if session_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_note_payload",
            "sessionId is required",
        );
    }
    match state.tasks.complete(session_id, &id) {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(crate::builtins::BuiltinsError::NotFound(_)) => error_response(
            StatusCode::NOT_FOUND,
            "task_not_found",
            format!("no task {id}"),
        ),
        Err(e) => internal_error("task completion failed", e),
    }
}

/// `GET /v1/tasks?sessionId=&limit=`
pub(super) async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session_id) = params.get("sessionId").filter(|s| !s.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_note_payload",
            "sessionId is required",
        );
    };
    match state.tasks.list(session_id, parse_limit(&params)) {
        Ok(tasks) => (
            StatusCode::OK,
            Json(json!({ "count": tasks.len(), "tasks": tasks })),
        )
            .into_response(),
        Err(e) => internal_error("task listing failed", e),
    }
}

/// `POST /v1/reminders`
pub(super) async fn add_reminder(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let session_id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    let text = body.get("text").and_then(Value::as_str).unwrap_or("");
    let remind_at = body.get("remindAt").and_then(Value::as_str).unwrap_or("");
    if session_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_reminder_payload",
            "sessionId is required",
        );
    }

    match state.reminders.add(session_id, text, remind_at) {
        Ok(reminder) => (StatusCode::CREATED, Json(reminder)).into_response(),
        Err(
            e @ (crate::reminders::ReminderError::EmptyText
            | crate::reminders::ReminderError::InvalidRemindAt(_)),
        ) => error_response(StatusCode::BAD_REQUEST, "invalid_reminder_payload", e.to_string()),
        Err(e) => internal_error("reminder creation failed", e),
    }
}

/// `GET /v1/reminders?sessionId=`
pub(super) async fn list_reminders(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session_id) = params.get("sessionId").filter(|s| !s.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_reminder_payload",
            "sessionId is required",
        );
    };
    match state.reminders.list_by_session(session_id) {
        Ok(reminders) => (
            StatusCode::OK,
            Json(json!({ "count": reminders.len(), "reminders": reminders })),
        )
            .into_response(),
        Err(e) => internal_error("reminder listing failed", e),
    }
}

// ── Health ──────────────────────────────────────────────────────

/// `GET /health`
pub(super) async fn health(State(state): State<AppState>) -> Response {
    match state.jobs.status_counts() {
        Ok(counts) => (
            StatusCode::OK,
            Json(json!({
                "service": SERVICE_NAME,
                "status": "ok",
                "queue": counts,
            })),
        )
            .into_response(),
        Err(e) => internal_error("health check failed", e),
    }
}

// ── Helpers ─────────────────────────────────────────────────────

fn session_and_text(body: &Value) -> Result<(&str, &str), String> {
    let session_id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    if session_id.is_empty() {
        return Err("sessionId is required".to_owned());
    }
    let text = body.get("text").and_then(Value::as_str).unwrap_or("");
    Ok((session_id, text))
}

fn parse_limit(params: &HashMap<String, String>) -> usize {
    params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(100)
}

fn split_csv(raw: Option<&String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_time(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
