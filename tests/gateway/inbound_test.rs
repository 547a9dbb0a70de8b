//! Direct inbound pipeline: chat replies, job requests, approvals.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use straylight::approvals::ApprovalStore;
use straylight::dedupe::DedupeStore;
use straylight::events::{ConversationLog, EventQuery, StreamConfig};
use straylight::gateway::{Gateway, GatewayError, GatewayResponse, InboundMessage};
use straylight::jobs::{JobStatus, JobStore};
use straylight::outbound::NotificationStore;
use straylight::runspec::{
    PutRunSpec, RunSpec, RunSpecStep, RunSpecStore, RunStatus, StepApproval, StepStatus,
};
use straylight::services::{ApprovalAction, LlmService};
use straylight::state::{EventJournal, StatePaths};

struct Fixture {
    gateway: Gateway,
    jobs: Arc<JobStore>,
    approvals: Arc<ApprovalStore>,
    runs: Arc<RunSpecStore>,
    notifications: Arc<NotificationStore>,
    conversation: Arc<ConversationLog>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = Arc::new(StatePaths::new(dir.path()));
    let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
    let jobs = Arc::new(JobStore::new(Arc::clone(&paths), Arc::clone(&journal)));
    let approvals = Arc::new(ApprovalStore::new(Arc::clone(&paths), 600_000));
    let runs = Arc::new(RunSpecStore::new(Arc::clone(&paths)));
    let notifications = Arc::new(NotificationStore::new(Arc::clone(&paths)));
    let conversation = Arc::new(ConversationLog::new(
        journal,
        StreamConfig {
            dedupe_window_ms: 0,
            ..StreamConfig::default()
        },
    ));
    let dedupe = Arc::new(DedupeStore::new(Arc::clone(&paths), 86_400_000));

    let gateway = Gateway::new(
        Arc::clone(&jobs),
        Arc::clone(&approvals),
        Arc::clone(&runs),
        Arc::clone(&notifications),
        Arc::clone(&conversation),
        dedupe,
    );

    Fixture {
        gateway,
        jobs,
        approvals,
        runs,
        notifications,
        conversation,
        _dir: dir,
    }
}

#[tokio::test]
async fn plain_text_yields_deterministic_ack() {
    let f = fixture();
    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "hi"))
        .await
        .expect("handle");
    assert_eq!(
        response,
        GatewayResponse::Chat {
            response: "ack:hi".to_owned()
        }
    );

    // Both directions land in the conversation log.
    let events = f.conversation.query(&EventQuery {
        session_id: Some("s1".to_owned()),
        ..EventQuery::default()
    });
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].direction, "outbound");
    assert_eq!(events[1].direction, "inbound");
}

#[tokio::test]
async fn configured_llm_takes_over_chat_replies() {
    struct CannedLlm;

    #[async_trait]
    impl LlmService for CannedLlm {
        async fn generate_text(
            &self,
            _session_id: &str,
            input: &str,
        ) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("thought about: {input}")))
        }
    }

    let f = fixture();
    let gateway = f.gateway.with_llm(Arc::new(CannedLlm));
    let response = gateway
        .handle_inbound(InboundMessage::http("s1", "hello"))
        .await
        .expect("handle");
    assert_eq!(
        response,
        GatewayResponse::Chat {
            response: "thought about: hello".to_owned()
        }
    );
}

#[tokio::test]
async fn empty_fields_are_rejected_without_touching_state() {
    let f = fixture();
    let err = f
        .gateway
        .handle_inbound(InboundMessage::http("", "hi"))
        .await
        .expect_err("reject");
    assert!(matches!(err, GatewayError::InvalidInbound(_)));

    let err = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "   "))
        .await
        .expect_err("reject");
    assert!(matches!(err, GatewayError::InvalidInbound(_)));

    assert!(f.jobs.list_jobs(10).expect("list").is_empty());
    assert!(f.conversation.is_empty());
}

#[tokio::test]
async fn request_job_creates_queued_job_and_notification() {
    let f = fixture();
    let response = f
        .gateway
        .handle_inbound(InboundMessage {
            session_id: "s1".to_owned(),
            text: "work".to_owned(),
            request_job: true,
            metadata: json!({"origin": "test"}),
            channel: "http".to_owned(),
        })
        .await
        .expect("handle");

    let GatewayResponse::AsyncJob { job_id } = response else {
        panic!("expected async job, got {response:?}");
    };

    let job = f.jobs.get_job(&job_id).expect("get").expect("some");
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.job_type, "stub_task");
    assert_eq!(job.priority, 5);
    assert_eq!(job.session_id(), Some("s1"));
    assert_eq!(
        job.payload.get("text").and_then(Value::as_str),
        Some("work")
    );
    // Metadata merged into the payload.
    assert_eq!(
        job.payload.get("origin").and_then(Value::as_str),
        Some("test")
    );

    let pending = f.notifications.list_pending().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id.as_deref(), Some(job_id.as_str()));
}

#[tokio::test]
async fn explicit_token_approval_runs_registered_action() {
    struct RecordingAction(Arc<std::sync::Mutex<Vec<Value>>>);

    #[async_trait]
    impl ApprovalAction for RecordingAction {
        async fn run(&self, _session_id: &str, payload: &Value) -> anyhow::Result<String> {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(payload.clone());
            }
            Ok("file written".to_owned())
        }
    }

    let f = fixture();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    f.gateway
        .register_action("file.write", Arc::new(RecordingAction(Arc::clone(&seen))));

    let approval = f
        .approvals
        .create("s1", "file.write", json!({"path": "/tmp/report"}), None)
        .expect("create");

    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", format!("approve {}", approval.token)))
        .await
        .expect("handle");

    let GatewayResponse::Approval {
        decision,
        resolved,
        action,
        detail,
        ..
    } = response
    else {
        panic!("expected approval response");
    };
    assert_eq!(decision, "approve");
    assert!(resolved);
    assert_eq!(action.as_deref(), Some("file.write"));
    assert_eq!(detail, "file written");

    let invocations = seen.lock().expect("seen");
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0], json!({"path": "/tmp/report"}));

    // Single-use: the token is gone.
    assert!(f
        .approvals
        .consume("s1", &approval.token)
        .expect("consume")
        .is_none());
}

#[tokio::test]
async fn bare_yes_consumes_latest_and_bare_no_discards() {
    let f = fixture();
    f.approvals
        .create("s1", "older.action", json!({}), None)
        .expect("create");
    std::thread::sleep(std::time::Duration::from_millis(5));
    f.approvals
        .create("s1", "newer.action", json!({}), None)
        .expect("create");

    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "yes"))
        .await
        .expect("handle");
    let GatewayResponse::Approval {
        resolved, action, ..
    } = response
    else {
        panic!("expected approval response");
    };
    assert!(resolved);
    assert_eq!(action.as_deref(), Some("newer.action"));

    // The older approval is still pending; a bare no discards it.
    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "no"))
        .await
        .expect("handle");
    let GatewayResponse::Approval {
        decision, resolved, ..
    } = response
    else {
        panic!("expected approval response");
    };
    assert_eq!(decision, "reject");
    assert!(resolved);

    assert!(f.approvals.list_by_session("s1", 10).expect("list").is_empty());
}

#[tokio::test]
async fn approval_verbs_without_pending_approvals_resolve_to_nothing() {
    let f = fixture();
    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "yes"))
        .await
        .expect("handle");
    let GatewayResponse::Approval { resolved, .. } = response else {
        panic!("expected approval response");
    };
    assert!(!resolved);
}

#[tokio::test]
async fn step_approval_command_grants_the_step() {
    let f = fixture();
    f.runs
        .put(PutRunSpec {
            run_id: "r1".to_owned(),
            session_id: "s1".to_owned(),
            spec: RunSpec {
                steps: vec![RunSpecStep {
                    id: "write".to_owned(),
                    step_type: "file.write".to_owned(),
                    name: "write report".to_owned(),
                    input: json!({}),
                    timeout_ms: None,
                    retries: None,
                    approval: Some(StepApproval {
                        required: true,
                        capability: Some("file.write".to_owned()),
                    }),
                }],
            },
            status: RunStatus::Queued,
            approved_step_ids: Vec::new(),
            job_id: None,
        })
        .expect("put");

    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "approve step write of run r1"))
        .await
        .expect("handle");
    assert_eq!(
        response,
        GatewayResponse::StepApproval {
            run_id: "r1".to_owned(),
            step_id: "write".to_owned(),
        }
    );

    let record = f.runs.get("r1").expect("get").expect("some");
    assert!(record.is_step_approved("write"));
    assert_eq!(
        record.step_state("write").expect("state").status,
        StepStatus::Approved
    );
}

#[tokio::test]
async fn step_approval_for_unknown_run_stays_conversational() {
    let f = fixture();
    let response = f
        .gateway
        .handle_inbound(InboundMessage::http("s1", "approve step x of run ghost"))
        .await
        .expect("handle");
    assert!(matches!(response, GatewayResponse::Chat { .. }));
}
