//! Worker pool behavior: drain, retry chains, cooperative cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use straylight::jobs::{
    CreateJob, Job, JobStatus, JobStore, ProcessContext, Processor, ReceiptStatus, StatusEvent,
    StatusKind, WorkerPool, WorkerPoolConfig,
};
use straylight::state::{EventJournal, StatePaths};

fn job_store() -> (Arc<JobStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = Arc::new(StatePaths::new(dir.path()));
    let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
    (Arc::new(JobStore::new(paths, journal)), dir)
}

fn collecting_sink() -> (Arc<Mutex<Vec<StatusEvent>>>, straylight::jobs::StatusSink) {
    let events: Arc<Mutex<Vec<StatusEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = Arc::clone(&events);
        Arc::new(move |event: StatusEvent| {
            if let Ok(mut events) = events.lock() {
                events.push(event);
            }
        }) as straylight::jobs::StatusSink
    };
    (events, sink)
}

fn fast_pool(
    store: &Arc<JobStore>,
    processor: Arc<dyn Processor>,
    sink: straylight::jobs::StatusSink,
) -> WorkerPool {
    WorkerPool::new(
        Arc::clone(store),
        processor,
        sink,
        WorkerPoolConfig {
            worker_count: 1,
            poll_interval_ms: 10,
            ..WorkerPoolConfig::default()
        },
    )
}

async fn wait_terminal(store: &JobStore, id: &str) -> Job {
    for _ in 0..300 {
        let job = store.get_job(id).expect("get").expect("exists");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached a terminal state");
}

async fn wait_status(store: &JobStore, id: &str, status: JobStatus) -> Job {
    for _ in 0..300 {
        let job = store.get_job(id).expect("get").expect("exists");
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {status}");
}

/// Fails with a transient-looking error on the first attempt, succeeds on
/// retries.
struct FlakyProcessor;

#[async_trait]
impl Processor for FlakyProcessor {
    async fn process(&self, job: &Job, _ctx: &ProcessContext) -> anyhow::Result<Value> {
        if job.retry_attempt() == 0 {
            anyhow::bail!("fetch failed");
        }
        let text = job
            .payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(json!({ "summary": format!("processed:{text}") }))
    }
}

/// Sleeps long enough for a cancel to land mid-run, then returns a result.
struct SlowProcessor;

#[async_trait]
impl Processor for SlowProcessor {
    async fn process(&self, _job: &Job, _ctx: &ProcessContext) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({ "summary": "finished anyway" }))
    }
}

/// Reports progress mid-run.
struct ProgressProcessor;

#[async_trait]
impl Processor for ProgressProcessor {
    async fn process(&self, _job: &Job, ctx: &ProcessContext) -> anyhow::Result<Value> {
        ctx.report_progress(straylight::jobs::JobProgress {
            at: chrono::Utc::now(),
            message: "halfway".to_owned(),
            step: Some("crunch".to_owned()),
            percent: Some(50.0),
            phase: Some("work".to_owned()),
            details: None,
        })
        .expect("progress");
        Ok(json!({ "summary": "done" }))
    }
}

#[tokio::test]
async fn retryable_failure_spawns_exactly_one_child_that_succeeds() {
    let (store, _dir) = job_store();
    let (events, sink) = collecting_sink();

    let original = store
        .create_job(CreateJob {
            job_type: "flaky".to_owned(),
            payload: json!({"text": "work", "sessionId": "s1", "maxRetries": 1}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");

    let pool = fast_pool(&store, Arc::new(FlakyProcessor), sink);
    pool.start();

    let failed = wait_terminal(&store, &original.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.error.as_ref().expect("error").code,
        "processor_retryable_failure"
    );
    assert!(failed.error.as_ref().expect("error").retryable);

    // Exactly one child exists and it succeeds.
    let child = 'found: {
        for _ in 0..300 {
            let jobs = store.list_jobs(50).expect("list");
            if let Some(child) = jobs
                .iter()
                .find(|j| j.retry_of.as_deref() == Some(original.id.as_str()))
            {
                if child.status.is_terminal() {
                    break 'found child.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no settled retry child found");
    };
    pool.shutdown().await;

    assert_eq!(child.status, JobStatus::Succeeded);
    assert_eq!(child.retry_attempt(), 1);
    assert_eq!(
        child
            .result
            .as_ref()
            .and_then(|r| r.get("summary"))
            .and_then(Value::as_str),
        Some("processed:work")
    );

    // Two records total: the failed original and the succeeded child.
    let all = store.list_jobs(50).expect("list");
    assert_eq!(all.len(), 2);

    // Both receipts exist.
    let original_receipt = store.get_receipt(&original.id).expect("get").expect("some");
    assert_eq!(original_receipt.status, ReceiptStatus::Failed);
    let child_receipt = store.get_receipt(&child.id).expect("get").expect("some");
    assert_eq!(child_receipt.status, ReceiptStatus::Success);

    // The original emitted a retrying progress event, not a failed one.
    let seen = events.lock().expect("events");
    let for_original: Vec<&StatusEvent> =
        seen.iter().filter(|e| e.job_id == original.id).collect();
    assert!(for_original
        .iter()
        .any(|e| e.kind == StatusKind::Progress && e.step.as_deref() == Some("retrying")));
    assert!(!for_original.iter().any(|e| e.kind == StatusKind::Failed));
}

#[tokio::test]
async fn exhausted_retries_emit_terminal_failure() {
    let (store, _dir) = job_store();
    let (events, sink) = collecting_sink();

    // maxRetries = 0: the first failure is terminal.
    let job = store
        .create_job(CreateJob {
            job_type: "flaky".to_owned(),
            payload: json!({"text": "work", "sessionId": "s1"}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");

    let pool = fast_pool(&store, Arc::new(FlakyProcessor), sink);
    pool.start();
    let failed = wait_terminal(&store, &job.id).await;
    pool.shutdown().await;

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(store.list_jobs(50).expect("list").len(), 1);

    let seen = events.lock().expect("events");
    assert!(seen
        .iter()
        .any(|e| e.job_id == job.id && e.kind == StatusKind::Failed));
}

#[tokio::test]
async fn cancel_while_running_preserves_result() {
    let (store, _dir) = job_store();
    let (events, sink) = collecting_sink();

    let job = store
        .create_job(CreateJob {
            job_type: "slow".to_owned(),
            payload: json!({"sessionId": "s1"}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");

    let pool = fast_pool(&store, Arc::new(SlowProcessor), sink);
    pool.start();

    wait_status(&store, &job.id, JobStatus::Running).await;
    let cancelling = store.cancel_job(&job.id).expect("cancel").expect("some");
    assert_eq!(cancelling.status, JobStatus::Cancelling);

    let done = wait_terminal(&store, &job.id).await;
    pool.shutdown().await;

    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(
        done.result
            .as_ref()
            .and_then(|r| r.get("summary"))
            .and_then(Value::as_str),
        Some("finished anyway")
    );

    let receipt = store.get_receipt(&job.id).expect("get").expect("some");
    assert_eq!(receipt.status, ReceiptStatus::Cancelled);

    let seen = events.lock().expect("events");
    assert!(seen
        .iter()
        .any(|e| e.job_id == job.id && e.kind == StatusKind::Cancelled));
}

#[tokio::test]
async fn progress_reports_are_persisted_and_emitted() {
    let (store, _dir) = job_store();
    let (events, sink) = collecting_sink();

    let job = store
        .create_job(CreateJob {
            job_type: "progress".to_owned(),
            payload: json!({"sessionId": "s1"}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");

    let pool = fast_pool(&store, Arc::new(ProgressProcessor), sink);
    pool.start();
    let done = wait_terminal(&store, &job.id).await;
    pool.shutdown().await;

    assert_eq!(done.status, JobStatus::Succeeded);
    let progress = done.progress.expect("progress persisted");
    assert_eq!(progress.message, "halfway");
    assert_eq!(progress.percent, Some(50.0));

    let seen = events.lock().expect("events");
    let progress_event = seen
        .iter()
        .find(|e| e.kind == StatusKind::Progress)
        .expect("progress event");
    assert_eq!(progress_event.summary.as_deref(), Some("halfway"));
    assert_eq!(progress_event.step.as_deref(), Some("crunch"));
    assert_eq!(progress_event.phase.as_deref(), Some("work"));
}

#[tokio::test]
async fn claim_lock_is_released_after_each_outcome() {
    let (store, _dir) = job_store();
    let (_events, sink) = collecting_sink();

    let ok = store
        .create_job(CreateJob {
            job_type: "flaky".to_owned(),
            payload: json!({"text": "a", "sessionId": "s1", "retryAttempt": 1}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");

    let pool = fast_pool(&store, Arc::new(FlakyProcessor), sink);
    pool.start();
    wait_terminal(&store, &ok.id).await;
    pool.shutdown().await;

    assert!(!store.claim_held(&ok.id));
}
