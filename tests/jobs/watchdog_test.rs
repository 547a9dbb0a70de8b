//! Watchdog recovery of stuck jobs.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use straylight::jobs::{CreateJob, JobStatus, JobStore, WatchdogTimeouts};
use straylight::state::{self, EventJournal, StatePaths};

fn fixture() -> (Arc<JobStore>, Arc<StatePaths>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = Arc::new(StatePaths::new(dir.path()));
    let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
    (
        Arc::new(JobStore::new(Arc::clone(&paths), journal)),
        paths,
        dir,
    )
}

/// Rewrite a job record with an aged `updatedAt`, simulating a worker
/// that stopped heartbeating.
fn age_job(paths: &StatePaths, id: &str, seconds: i64) {
    let path = paths.job_file(id);
    let mut job: straylight::jobs::Job = state::read_json(&path).expect("read").expect("some");
    job.updated_at = Utc::now() - chrono::Duration::seconds(seconds);
    state::write_json_atomic(&path, &job).expect("write");
}

#[test]
fn stale_running_job_fails_with_watchdog_timeout() {
    let (store, paths, _dir) = fixture();
    let job = store
        .create_job(CreateJob {
            job_type: "stub_task".to_owned(),
            payload: json!({"sessionId": "s1"}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");
    store.claim_next_queued_job("w1").expect("claim").expect("some");
    age_job(&paths, &job.id, 3_600);

    let recovered = store
        .recover_stuck_jobs(WatchdogTimeouts {
            running_ms: 1_000, // clamped up to the 30 s floor
            cancelling_ms: 10_000,
        })
        .expect("recover");

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].status, JobStatus::Failed);
    let error = recovered[0].error.as_ref().expect("error");
    assert_eq!(error.code, "watchdog_timeout");
    assert!(!error.retryable);

    // Lock released so a retry child could be claimed again.
    assert!(!store.claim_held(&job.id));

    // Exactly one receipt, and the terminal state sticks.
    let receipt = store.get_receipt(&job.id).expect("get").expect("some");
    assert_eq!(receipt.job_id, job.id);
    let reread = store.get_job(&job.id).expect("get").expect("some");
    assert_eq!(reread.status, JobStatus::Failed);
}

#[test]
fn stale_cancelling_job_is_recovered_with_the_shorter_timeout() {
    let (store, paths, _dir) = fixture();
    let job = store
        .create_job(CreateJob {
            job_type: "stub_task".to_owned(),
            payload: json!({"sessionId": "s1"}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");
    store.claim_next_queued_job("w1").expect("claim").expect("some");
    store.cancel_job(&job.id).expect("cancel");
    age_job(&paths, &job.id, 60);

    let recovered = store
        .recover_stuck_jobs(WatchdogTimeouts {
            running_ms: 600_000,
            cancelling_ms: 10_000,
        })
        .expect("recover");

    assert_eq!(recovered.len(), 1);
    assert_eq!(
        recovered[0].error.as_ref().expect("error").code,
        "watchdog_timeout"
    );
}

#[test]
fn fresh_jobs_survive_the_sweep() {
    let (store, _paths, _dir) = fixture();
    store
        .create_job(CreateJob {
            job_type: "stub_task".to_owned(),
            payload: json!({}),
            priority: 5,
            requested_skill: None,
        })
        .expect("create");
    store.claim_next_queued_job("w1").expect("claim").expect("some");

    let recovered = store
        .recover_stuck_jobs(WatchdogTimeouts::default())
        .expect("recover");
    assert!(recovered.is_empty());
}
