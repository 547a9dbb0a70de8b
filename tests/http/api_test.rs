//! API contract tests driven through the axum router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use straylight::adapters::console::ConsoleAdapter;
use straylight::config::Config;
use straylight::http;
use straylight::runtime::Runtime;

struct Harness {
    router: Router,
    runtime: Runtime,
    _dir: tempfile::TempDir,
}

fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config {
        state_dir: dir.path().to_path_buf(),
        worker_poll_ms: 25,
        notification_poll_ms: 25,
        reminder_poll_ms: 100,
        ..Config::default()
    };
    configure(&mut config);

    let runtime =
        Runtime::build(config, Arc::new(ConsoleAdapter::new()), None).expect("runtime");
    let router = http::build_router(runtime.app_state());
    Harness {
        router,
        runtime,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    };
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn inbound_chat_acks_deterministically() {
    let h = harness();
    let (status, body) = call(
        &h.router,
        "POST",
        "/v1/messages/inbound",
        Some(json!({"sessionId": "s1", "text": "hi", "requestJob": false})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "chat");
    assert_eq!(body["response"], "ack:hi");
}

#[tokio::test]
async fn inbound_without_session_is_a_400() {
    let h = harness();
    let (status, body) = call(
        &h.router,
        "POST",
        "/v1/messages/inbound",
        Some(json!({"text": "hi"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_inbound_message");
}

#[tokio::test]
async fn async_job_roundtrip_through_worker() {
    let h = harness();
    h.runtime.start();

    let (status, body) = call(
        &h.router,
        "POST",
        "/v1/messages/inbound",
        Some(json!({"sessionId": "s1", "text": "work", "requestJob": true})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["mode"], "async-job");
    let job_id = body["jobId"].as_str().expect("jobId").to_owned();

    let mut last = Value::Null;
    for _ in 0..300 {
        let (status, job) = call(&h.router, "GET", &format!("/v1/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if job["status"] == "succeeded" {
            last = job;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.runtime.shutdown().await;

    assert_eq!(last["status"], "succeeded", "job never drained: {last}");
    assert_eq!(last["result"]["summary"], "processed:work");

    let (status, receipt) = call(
        &h.router,
        "GET",
        &format!("/v1/jobs/{job_id}/receipt"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["status"], "success");
}

#[tokio::test]
async fn baileys_webhook_deduplicates_and_checks_token() {
    let h = harness_with(|config| {
        config.baileys_inbound_token = Some("hunter2".to_owned());
    });

    let body = json!({
        "key": {"id": "m-1", "remoteJid": "u@x"},
        "message": {"conversation": "/job run"},
    });

    // Missing token: 401, nothing processed.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/whatsapp/baileys/inbound")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = h.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Correct token: accepted with a job.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/whatsapp/baileys/inbound")
        .header("content-type", "application/json")
        .header("x-baileys-inbound-token", "hunter2")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = h.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let first: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(first["mode"], "async-job");
    assert_eq!(first["duplicate"], false);
    assert!(first["jobId"].is_string());

    // Replay: dedupe hit.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/whatsapp/baileys/inbound")
        .header("content-type", "application/json")
        .header("x-baileys-inbound-token", "hunter2")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = h.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let second: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(second["duplicate"], true);

    // Only one job exists.
    let (_, jobs) = call(&h.router, "GET", "/v1/jobs?limit=10", None).await;
    assert_eq!(jobs["count"], 1);
}

#[tokio::test]
async fn job_routes_cover_not_found_and_retry_conflict() {
    let h = harness();

    let (status, body) = call(&h.router, "GET", "/v1/jobs/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "job_not_found");

    let (status, _) = call(&h.router, "POST", "/v1/jobs/ghost/cancel", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A queued job is not retryable.
    let (status, created) = call(
        &h.router,
        "POST",
        "/v1/jobs",
        Some(json!({"type": "stub_task", "payload": {"sessionId": "s1"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["status"], "queued");
    let job_id = created["jobId"].as_str().expect("jobId");

    let (status, body) = call(
        &h.router,
        "POST",
        &format!("/v1/jobs/{job_id}/retry"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "job_retry_unavailable");
}

#[tokio::test]
async fn cancel_queued_job_over_http() {
    let h = harness();
    let (_, created) = call(
        &h.router,
        "POST",
        "/v1/jobs",
        Some(json!({"type": "stub_task"})),
    )
    .await;
    let job_id = created["jobId"].as_str().expect("jobId");

    let (status, body) = call(
        &h.router,
        "POST",
        &format!("/v1/jobs/{job_id}/cancel"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn approvals_pending_requires_session_and_lists_newest_first() {
    let h = harness();

    let (status, _) = call(&h.router, "GET", "/v1/approvals/pending", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.runtime
        .approvals
        .create("s1", "file.write", json!({}), None)
        .expect("create");

    let (status, body) = call(
        &h.router,
        "GET",
        "/v1/approvals/pending?sessionId=s1&limit=5",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(body["count"], 1);
    assert_eq!(body["pending"][0]["action"], "file.write");
}

#[tokio::test]
async fn approval_resolve_mirrors_the_facade() {
    let h = harness();
    let approval = h
        .runtime
        .approvals
        .create("s1", "file.write", json!({}), None)
        .expect("create");

    let (status, body) = call(
        &h.router,
        "POST",
        "/v1/approvals/resolve",
        Some(json!({"sessionId": "s1", "decision": "approve", "token": approval.token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "approval");
    assert_eq!(body["decision"], "approve");
    assert_eq!(body["resolved"], true);

    let (status, body) = call(
        &h.router,
        "POST",
        "/v1/approvals/resolve",
        Some(json!({"sessionId": "s1", "decision": "maybe"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_approval_resolve_request");
}

#[tokio::test]
async fn run_routes_expose_records() {
    let h = harness();

    let (status, body) = call(&h.router, "GET", "/v1/runs/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "run_not_found");

    h.runtime
        .runs
        .put(straylight::runspec::PutRunSpec {
            run_id: "r1".to_owned(),
            session_id: "s1".to_owned(),
            spec: straylight::runspec::RunSpec { steps: Vec::new() },
            status: straylight::runspec::RunStatus::Queued,
            approved_step_ids: Vec::new(),
            job_id: None,
        })
        .expect("put");

    let (status, body) = call(&h.router, "GET", "/v1/runs/r1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runId"], "r1");
    assert_eq!(body["events"][0]["seq"], 1);

    let (status, body) = call(&h.router, "GET", "/v1/runs?sessionKey=s1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn event_stream_query_sees_conversation() {
    let h = harness();
    call(
        &h.router,
        "POST",
        "/v1/messages/inbound",
        Some(json!({"sessionId": "s1", "text": "hello there"})),
    )
    .await;

    let (status, body) = call(
        &h.router,
        "GET",
        "/v1/stream/events?sessionId=s1&directions=inbound",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["events"][0]["text"], "hello there");

    // Substring match is case-insensitive; the ack reply matches too.
    let (_, filtered) = call(
        &h.router,
        "GET",
        "/v1/stream/events?sessionId=s1&text=HELLO",
        None,
    )
    .await;
    assert_eq!(filtered["count"], 2);
}

#[tokio::test]
async fn notes_tasks_and_reminders_roundtrip() {
    let h = harness();

    let (status, note) = call(
        &h.router,
        "POST",
        "/v1/notes",
        Some(json!({"sessionId": "s1", "text": "remember this"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(note["text"], "remember this");

    let (status, body) = call(&h.router, "POST", "/v1/notes", Some(json!({"sessionId": "s1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_note_payload");

    let (_, listed) = call(&h.router, "GET", "/v1/notes?sessionId=s1", None).await;
    assert_eq!(listed["count"], 1);

    let (_, task) = call(
        &h.router,
        "POST",
        "/v1/tasks",
        Some(json!({"sessionId": "s1", "text": "ship it"})),
    )
    .await;
    let task_id = task["id"].as_str().expect("id");
    let (status, done) = call(
        &h.router,
        "POST",
        &format!("/v1/tasks/{task_id}/complete"),
        Some(json!({"sessionId": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "done");

    let remind_at = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    let (status, reminder) = call(
        &h.router,
        "POST",
        "/v1/reminders",
        Some(json!({"sessionId": "s1", "text": "call back", "remindAt": remind_at})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reminder["status"], "pending");

    let (_, reminders) = call(&h.router, "GET", "/v1/reminders?sessionId=s1", None).await;
    assert_eq!(reminders["count"], 1);
}

#[tokio::test]
async fn health_reports_queue_counts() {
    let h = harness();
    call(
        &h.router,
        "POST",
        "/v1/jobs",
        Some(json!({"type": "stub_task"})),
    )
    .await;

    let (status, body) = call(&h.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "straylight");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"]["queued"], 1);
    assert_eq!(body["queue"]["running"], 0);
}
