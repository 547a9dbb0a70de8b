//! Webhook pipeline: payload validation, dedupe, job commands.

use std::sync::Arc;

use serde_json::json;

use straylight::approvals::ApprovalStore;
use straylight::dedupe::DedupeStore;
use straylight::events::{ConversationLog, StreamConfig};
use straylight::gateway::{Gateway, GatewayError, GatewayResponse};
use straylight::jobs::JobStore;
use straylight::outbound::NotificationStore;
use straylight::runspec::RunSpecStore;
use straylight::state::{EventJournal, StatePaths};

fn fixture() -> (Gateway, Arc<JobStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = Arc::new(StatePaths::new(dir.path()));
    let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
    let jobs = Arc::new(JobStore::new(Arc::clone(&paths), Arc::clone(&journal)));
    let gateway = Gateway::new(
        Arc::clone(&jobs),
        Arc::new(ApprovalStore::new(Arc::clone(&paths), 600_000)),
        Arc::new(RunSpecStore::new(Arc::clone(&paths))),
        Arc::new(NotificationStore::new(Arc::clone(&paths))),
        Arc::new(ConversationLog::new(journal, StreamConfig::default())),
        Arc::new(DedupeStore::new(Arc::clone(&paths), 86_400_000)),
    );
    (gateway, jobs, dir)
}

fn webhook_body(message_id: &str, jid: &str, text: &str) -> serde_json::Value {
    json!({
        "key": { "id": message_id, "remoteJid": jid },
        "message": { "conversation": text },
    })
}

#[tokio::test]
async fn duplicate_delivery_is_dropped_and_only_one_job_exists() {
    let (gateway, jobs, _dir) = fixture();
    let body = webhook_body("m-1", "u@x", "/job run");

    let first = gateway.handle_baileys(&body).await.expect("first");
    assert!(!first.duplicate);
    let Some(GatewayResponse::AsyncJob { job_id }) = first.response else {
        panic!("expected async job, got {:?}", first.response);
    };

    let second = gateway.handle_baileys(&body).await.expect("second");
    assert!(second.duplicate);
    assert!(second.response.is_none());

    let all = jobs.list_jobs(10).expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, job_id);
    // Session is the sender's jid.
    assert_eq!(all[0].session_id(), Some("u@x"));
    assert_eq!(
        all[0].payload.get("text").and_then(serde_json::Value::as_str),
        Some("run")
    );
}

#[tokio::test]
async fn same_message_id_from_other_sender_is_not_a_duplicate() {
    let (gateway, _jobs, _dir) = fixture();

    let first = gateway
        .handle_baileys(&webhook_body("m-1", "u@x", "hello"))
        .await
        .expect("first");
    assert!(!first.duplicate);

    let other = gateway
        .handle_baileys(&webhook_body("m-1", "v@x", "hello"))
        .await
        .expect("other");
    assert!(!other.duplicate);
}

#[tokio::test]
async fn plain_conversation_gets_a_chat_reply() {
    let (gateway, jobs, _dir) = fixture();
    let outcome = gateway
        .handle_baileys(&webhook_body("m-2", "u@x", "good morning"))
        .await
        .expect("handle");

    assert!(!outcome.duplicate);
    assert_eq!(
        outcome.response,
        Some(GatewayResponse::Chat {
            response: "ack:good morning".to_owned()
        })
    );
    assert!(jobs.list_jobs(10).expect("list").is_empty());
}

#[tokio::test]
async fn malformed_payloads_are_rejected() {
    let (gateway, _jobs, _dir) = fixture();

    for body in [
        json!({}),
        json!({ "key": { "id": "m-1" }, "message": { "conversation": "hi" } }),
        json!({ "key": { "id": "m-1", "remoteJid": "u@x" }, "message": {} }),
        json!({ "key": { "id": "m-1", "remoteJid": "u@x" }, "message": { "conversation": "  " } }),
    ] {
        let err = gateway.handle_baileys(&body).await.expect_err("reject");
        assert!(matches!(err, GatewayError::InvalidBaileys(_)), "{body}");
    }
}

#[tokio::test]
async fn bare_job_command_still_creates_a_job() {
    let (gateway, jobs, _dir) = fixture();
    let outcome = gateway
        .handle_baileys(&webhook_body("m-3", "u@x", "/job"))
        .await
        .expect("handle");

    assert!(matches!(
        outcome.response,
        Some(GatewayResponse::AsyncJob { .. })
    ));
    let all = jobs.list_jobs(10).expect("list");
    assert_eq!(all.len(), 1);
    // With no trailing text the whole command becomes the job text.
    assert_eq!(
        all[0].payload.get("text").and_then(serde_json::Value::as_str),
        Some("/job")
    );
}
