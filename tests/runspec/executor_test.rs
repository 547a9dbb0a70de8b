//! Plan execution through the worker pool: approval gate, artifacts,
//! resumability.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use straylight::jobs::{
    CreateJob, Job, JobStatus, JobStore, StatusEvent, WorkerPool, WorkerPoolConfig,
};
use straylight::outbound::{NotificationKind, NotificationStore};
use straylight::processors::JobRouter;
use straylight::runspec::{
    PutRunSpec, RunEventType, RunSpec, RunSpecProcessor, RunSpecStep, RunSpecStore, RunStatus,
    StepApproval, StepStatus,
};
use straylight::state::{EventJournal, StatePaths};

struct Fixture {
    jobs: Arc<JobStore>,
    runs: Arc<RunSpecStore>,
    notifications: Arc<NotificationStore>,
    pool: WorkerPool,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = Arc::new(StatePaths::new(dir.path()));
    let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
    let jobs = Arc::new(JobStore::new(Arc::clone(&paths), journal));
    let runs = Arc::new(RunSpecStore::new(Arc::clone(&paths)));
    let notifications = Arc::new(NotificationStore::new(Arc::clone(&paths)));

    let router = JobRouter::new().register(
        "run_spec",
        Arc::new(RunSpecProcessor::new(
            Arc::clone(&runs),
            Arc::clone(&notifications),
            Arc::clone(&paths),
        )),
    );
    let pool = WorkerPool::new(
        Arc::clone(&jobs),
        Arc::new(router),
        Arc::new(|_event: StatusEvent| {}),
        WorkerPoolConfig {
            worker_count: 1,
            poll_interval_ms: 10,
            ..WorkerPoolConfig::default()
        },
    );

    Fixture {
        jobs,
        runs,
        notifications,
        pool,
        _dir: dir,
    }
}

fn gated_write_step() -> RunSpecStep {
    RunSpecStep {
        id: "write".to_owned(),
        step_type: "file.write".to_owned(),
        name: "write the report".to_owned(),
        input: json!({"name": "report.txt", "content": "all clear"}),
        timeout_ms: None,
        retries: None,
        approval: Some(StepApproval {
            required: true,
            capability: Some("file.write".to_owned()),
        }),
    }
}

fn put_run(f: &Fixture, run_id: &str, steps: Vec<RunSpecStep>) {
    f.runs
        .put(PutRunSpec {
            run_id: run_id.to_owned(),
            session_id: "s1".to_owned(),
            spec: RunSpec { steps },
            status: RunStatus::Queued,
            approved_step_ids: Vec::new(),
            job_id: None,
        })
        .expect("put");
}

fn drive_job(f: &Fixture, run_id: &str) -> String {
    f.jobs
        .create_job(CreateJob {
            job_type: "run_spec".to_owned(),
            payload: json!({"runId": run_id, "sessionId": "s1"}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create")
        .id
}

async fn wait_terminal(jobs: &JobStore, id: &str) -> Job {
    for _ in 0..300 {
        let job = jobs.get_job(id).expect("get").expect("some");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never settled");
}

#[tokio::test]
async fn unapproved_gated_step_fails_the_run_without_side_effects() {
    let f = fixture();
    put_run(&f, "r1", vec![gated_write_step()]);
    let job_id = drive_job(&f, "r1");

    f.pool.start();
    let job = wait_terminal(&f.jobs, &job_id).await;
    f.pool.shutdown().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error
        .as_ref()
        .expect("error")
        .message
        .contains("run_spec_approval_missing"));

    let record = f.runs.get("r1").expect("get").expect("some");
    assert_eq!(record.status, RunStatus::Failed);
    // Step state untouched by the guard.
    assert_eq!(
        record.step_state("write").expect("state").status,
        StepStatus::ApprovalRequired
    );
    // The guard asked for approval on the timeline.
    assert!(record
        .events
        .iter()
        .any(|e| e.event_type == RunEventType::ApprovalRequested));

    // No notification was enqueued.
    assert!(f.notifications.list_pending().expect("pending").is_empty());
}

#[tokio::test]
async fn approved_run_writes_artifact_and_enqueues_one_file_notification() {
    let f = fixture();
    put_run(&f, "r1", vec![gated_write_step()]);

    // First execution trips the guard.
    let first_job = drive_job(&f, "r1");
    f.pool.start();
    wait_terminal(&f.jobs, &first_job).await;

    // Grant and execute again.
    f.runs.grant_step_approval("r1", "write").expect("grant");
    let second_job = drive_job(&f, "r1");
    let job = wait_terminal(&f.jobs, &second_job).await;
    f.pool.shutdown().await;

    assert_eq!(job.status, JobStatus::Succeeded);

    let record = f.runs.get("r1").expect("get").expect("some");
    assert_eq!(record.status, RunStatus::Completed);
    let state = record.step_state("write").expect("state");
    assert_eq!(state.status, StepStatus::Completed);
    assert!(state.started_at.expect("started") <= state.ended_at.expect("ended"));

    // Exactly one file notification, pointing at a real artifact.
    let pending = f.notifications.list_pending().expect("pending");
    let files: Vec<_> = pending
        .iter()
        .filter(|n| n.kind == NotificationKind::File)
        .collect();
    assert_eq!(files.len(), 1);
    let artifact = files[0].file_path.as_deref().expect("path");
    assert_eq!(
        std::fs::read_to_string(artifact).expect("artifact readable"),
        "all clear"
    );
    assert_eq!(files[0].file_name.as_deref(), Some("report.txt"));

    // Timeline seq stays gap-free across both executions.
    for (index, event) in record.events.iter().enumerate() {
        let expected = u64::try_from(index).expect("fits") + 1;
        assert_eq!(event.seq, expected);
    }
}

#[tokio::test]
async fn multi_step_run_executes_in_order_and_reports_output() {
    let f = fixture();
    put_run(
        &f,
        "r2",
        vec![
            RunSpecStep {
                id: "plan".to_owned(),
                step_type: "note".to_owned(),
                name: "outline".to_owned(),
                input: json!({"message": "planning done"}),
                timeout_ms: None,
                retries: None,
                approval: None,
            },
            RunSpecStep {
                id: "tell".to_owned(),
                step_type: "message".to_owned(),
                name: "status update".to_owned(),
                input: json!({"text": "halfway there"}),
                timeout_ms: None,
                retries: None,
                approval: None,
            },
            RunSpecStep {
                id: "weird".to_owned(),
                step_type: "teleport".to_owned(),
                name: "unsupported".to_owned(),
                input: json!({}),
                timeout_ms: None,
                retries: None,
                approval: None,
            },
        ],
    );

    let job_id = drive_job(&f, "r2");
    f.pool.start();
    let job = wait_terminal(&f.jobs, &job_id).await;
    f.pool.shutdown().await;

    assert_eq!(job.status, JobStatus::Succeeded);

    let record = f.runs.get("r2").expect("get").expect("some");
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(
        record.step_state("plan").expect("state").status,
        StepStatus::Completed
    );
    assert_eq!(
        record.step_state("tell").expect("state").status,
        StepStatus::Completed
    );
    // Unknown handler types are skipped, not failed.
    assert_eq!(
        record.step_state("weird").expect("state").status,
        StepStatus::Skipped
    );

    // The message step queued a text notification.
    let pending = f.notifications.list_pending().expect("pending");
    assert!(pending
        .iter()
        .any(|n| n.text.as_deref() == Some("halfway there")));

    // The note step landed on the timeline.
    assert!(record
        .events
        .iter()
        .any(|e| e.event_type == RunEventType::Note
            && e.message.as_deref() == Some("planning done")));

    // The run record is bound to the driving job.
    assert_eq!(record.job_id.as_deref(), Some(job_id.as_str()));
}
