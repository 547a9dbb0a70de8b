//! Durable job store: CRUD, the claim protocol, and watchdog recovery.
//!
//! Each job is one JSON file under `jobs/`; claims are lock files under
//! `locks/` created with exclusive-create semantics, so at most one worker
//! ever sees a job in `running`. All mutations re-read the record, apply
//! the transition, and write the full snapshot atomically.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::{
    self, EventJournal, StateError, StatePaths,
};

use super::{Job, JobError, JobProgress, JobStatus, Receipt};

/// Floor for the running-job watchdog timeout (30 s).
const MIN_RUNNING_TIMEOUT_MS: i64 = 30_000;
/// Floor for the cancelling-job watchdog timeout (10 s).
const MIN_CANCELLING_TIMEOUT_MS: i64 = 10_000;
/// Ceiling for both watchdog timeouts (24 h).
const MAX_WATCHDOG_TIMEOUT_MS: i64 = 86_400_000;
/// Hard cap on retry chains regardless of the payload's `maxRetries`.
pub(crate) const RETRY_HARD_CAP: u64 = 5;

/// Errors raised by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// No job record with the given id.
    #[error("job not found: {0}")]
    NotFound(String),
    /// The requested transition is not a legal edge of the state machine.
    #[error("job {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Job id.
        id: String,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
    /// Retry requested for a job that is not in `failed` or `cancelled`.
    #[error("job {0} cannot be retried from status {1}")]
    RetryUnavailable(String, JobStatus),
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    /// Processor routing key.
    pub job_type: String,
    /// Free-form payload mapping.
    pub payload: Value,
    /// Scheduling priority; lower is more urgent.
    pub priority: i64,
    /// Optional skill hint.
    pub requested_skill: Option<String>,
}

/// Watchdog thresholds, clamped to documented floors and a 24 h ceiling.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogTimeouts {
    /// Maximum `updatedAt` age for a `running` job, in milliseconds.
    pub running_ms: u64,
    /// Maximum `updatedAt` age for a `cancelling` job, in milliseconds.
    pub cancelling_ms: u64,
}

impl Default for WatchdogTimeouts {
    fn default() -> Self {
        Self {
            running_ms: 600_000,
            cancelling_ms: 90_000,
        }
    }
}

/// Per-status job counts, exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Jobs currently executing.
    pub running: usize,
    /// Jobs with a pending cooperative cancellation.
    pub cancelling: usize,
    /// Jobs that finished successfully.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Jobs that were cancelled.
    pub cancelled: usize,
}

/// Durable job store over the state directory.
#[derive(Debug)]
pub struct JobStore {
    paths: Arc<StatePaths>,
    journal: Arc<EventJournal>,
}

impl JobStore {
    /// Create a store handle. Directories are created lazily on first write.
    pub fn new(paths: Arc<StatePaths>, journal: Arc<EventJournal>) -> Self {
        Self { paths, journal }
    }

    /// Create a new `queued` job and journal a `job.queued` event.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be written.
    pub fn create_job(&self, params: CreateJob) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: params.job_type,
            payload: params.payload,
            priority: params.priority,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            worker_id: None,
            retry_of: None,
            requested_skill: params.requested_skill,
            progress: None,
            result: None,
            error: None,
        };
        self.write_job(&job)?;
        self.journal_event("job.queued", &job, json!({ "priority": job.priority }));
        info!(job_id = %job.id, job_type = %job.job_type, "job queued");
        Ok(job)
    }

    /// Load a job by id.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure or a corrupt record.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(state::read_json(&self.paths.job_file(id))?)
    }

    /// List all jobs, newest first, bounded to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the jobs directory cannot be read.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.load_all()?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        jobs.truncate(limit.clamp(1, 500));
        Ok(jobs)
    }

    /// Atomically claim the most urgent queued job for `worker_id`.
    ///
    /// Candidates are ordered by `(priority asc, createdAt asc)`; for each,
    /// the claim lock is taken with exclusive-create, the record is
    /// re-read, and only a still-`queued` job is moved to `running`. Losing
    /// a race releases the lock and moves on to the next candidate.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure.
    pub fn claim_next_queued_job(&self, worker_id: &str) -> Result<Option<Job>, JobStoreError> {
        let mut candidates: Vec<Job> = self
            .load_all()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        for candidate in candidates {
            let lock = self.paths.lock_file(&candidate.id);
            if !state::try_acquire_lock(&lock)? {
                continue;
            }

            // Re-read under the lock: another worker may have claimed (or a
            // handler cancelled) the job between the listing and the lock.
            match self.get_job(&candidate.id)? {
                Some(mut fresh) if fresh.status == JobStatus::Queued => {
                    let now = Utc::now();
                    fresh.status = JobStatus::Running;
                    fresh.started_at = Some(now);
                    fresh.updated_at = now;
                    fresh.worker_id = Some(worker_id.to_owned());
                    if let Err(e) = self.write_job(&fresh) {
                        state::release_lock(&lock);
                        return Err(e);
                    }
                    debug!(job_id = %fresh.id, worker_id, "job claimed");
                    return Ok(Some(fresh));
                }
                _ => state::release_lock(&lock),
            }
        }
        Ok(None)
    }

    /// Persist a progress report and journal a `job.progress` event.
    ///
    /// `percent` is clamped to `[0, 100]`; an empty `phase` is dropped.
    /// Progress on a terminal job is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::NotFound`] for an unknown id.
    pub fn update_job_progress(
        &self,
        id: &str,
        mut progress: JobProgress,
    ) -> Result<Job, JobStoreError> {
        let mut job = self.require(id)?;
        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "dropping progress for terminal job");
            return Ok(job);
        }

        progress.at = Utc::now();
        progress.percent = progress.percent.map(|p| p.clamp(0.0, 100.0));
        progress.phase = progress.phase.filter(|p| !p.trim().is_empty());

        self.journal_event(
            "job.progress",
            &job,
            json!({
                "message": progress.message,
                "step": progress.step,
                "percent": progress.percent,
            }),
        );

        job.progress = Some(progress);
        job.updated_at = Utc::now();
        self.write_job(&job)?;
        Ok(job)
    }

    /// Move a running job to `succeeded`, write its receipt, and journal
    /// a `job.succeeded` event.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::InvalidTransition`] unless the job is
    /// `running`.
    pub fn complete_job(&self, id: &str, result: Value) -> Result<Job, JobStoreError> {
        let mut job = self.require(id)?;
        if job.status != JobStatus::Running {
            return Err(JobStoreError::InvalidTransition {
                id: id.to_owned(),
                from: job.status,
                to: JobStatus::Succeeded,
            });
        }
        let now = Utc::now();
        job.status = JobStatus::Succeeded;
        job.result = Some(result);
        job.ended_at = Some(now);
        job.updated_at = now;
        self.write_job(&job)?;
        self.write_receipt(&job)?;
        self.journal_event("job.succeeded", &job, Value::Null);
        info!(job_id = %id, "job succeeded");
        Ok(job)
    }

    /// Move a `running` or `cancelling` job to `failed`, write its receipt,
    /// and journal a `job.failed` event.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::InvalidTransition`] from any other state.
    pub fn fail_job(&self, id: &str, error: JobError) -> Result<Job, JobStoreError> {
        let mut job = self.require(id)?;
        if !matches!(job.status, JobStatus::Running | JobStatus::Cancelling) {
            return Err(JobStoreError::InvalidTransition {
                id: id.to_owned(),
                from: job.status,
                to: JobStatus::Failed,
            });
        }
        let now = Utc::now();
        warn!(job_id = %id, code = %error.code, retryable = error.retryable, "job failed");
        job.status = JobStatus::Failed;
        job.error = Some(error);
        job.ended_at = Some(now);
        job.updated_at = now;
        self.write_job(&job)?;
        self.write_receipt(&job)?;
        self.journal_event("job.failed", &job, Value::Null);
        Ok(job)
    }

    /// Request cancellation.
    ///
    /// A `queued` job is cancelled outright (terminal, receipt written).
    /// A `running` job moves to `cancelling`; the worker observes that
    /// after the processor returns. Anything else is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure; `Ok(None)` for an unknown id.
    pub fn cancel_job(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let Some(mut job) = self.get_job(id)? else {
            return Ok(None);
        };
        match job.status {
            JobStatus::Queued => {
                let now = Utc::now();
                job.status = JobStatus::Cancelled;
                job.ended_at = Some(now);
                job.updated_at = now;
                self.write_job(&job)?;
                self.write_receipt(&job)?;
                self.journal_event("job.cancelled", &job, json!({ "beforeStart": true }));
                info!(job_id = %id, "job cancelled before start");
            }
            JobStatus::Running => {
                job.status = JobStatus::Cancelling;
                job.updated_at = Utc::now();
                self.write_job(&job)?;
                self.journal_event("job.cancelling", &job, Value::Null);
                info!(job_id = %id, "job cancellation requested");
            }
            _ => {
                debug!(job_id = %id, status = %job.status, "cancel is a no-op");
            }
        }
        Ok(Some(job))
    }

    /// Finish a cooperative cancellation after the processor returned.
    ///
    /// The processor's result, if any, is preserved on the record.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::InvalidTransition`] unless the job is
    /// `cancelling`.
    pub fn mark_cancelled_after_run(
        &self,
        id: &str,
        result: Option<Value>,
    ) -> Result<Job, JobStoreError> {
        let mut job = self.require(id)?;
        if job.status != JobStatus::Cancelling {
            return Err(JobStoreError::InvalidTransition {
                id: id.to_owned(),
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        if result.is_some() {
            job.result = result;
        }
        job.ended_at = Some(now);
        job.updated_at = now;
        self.write_job(&job)?;
        self.write_receipt(&job)?;
        self.journal_event("job.cancelled", &job, json!({ "beforeStart": false }));
        info!(job_id = %id, "job cancelled after run");
        Ok(job)
    }

    /// Create a retry child for a `failed` or `cancelled` job.
    ///
    /// The child copies type, priority, skill, and payload; its payload
    /// carries `retryAttempt + 1` and `retryRootJobId`, and the record
    /// points back via `retryOf`.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::RetryUnavailable`] from a non-retryable
    /// state.
    pub fn retry_job(&self, id: &str) -> Result<Job, JobStoreError> {
        let parent = self.require(id)?;
        if !matches!(parent.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(JobStoreError::RetryUnavailable(id.to_owned(), parent.status));
        }

        let mut payload = parent.payload.clone();
        if !payload.is_object() {
            payload = json!({});
        }
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "retryAttempt".to_owned(),
                json!(parent.retry_attempt().saturating_add(1)),
            );
            let root = parent
                .payload
                .get("retryRootJobId")
                .and_then(Value::as_str)
                .unwrap_or(&parent.id)
                .to_owned();
            map.insert("retryRootJobId".to_owned(), Value::String(root));
        }

        let now = Utc::now();
        let child = Job {
            id: Uuid::new_v4().to_string(),
            job_type: parent.job_type.clone(),
            payload,
            priority: parent.priority,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            worker_id: None,
            retry_of: Some(parent.id.clone()),
            requested_skill: parent.requested_skill.clone(),
            progress: None,
            result: None,
            error: None,
        };
        self.write_job(&child)?;
        self.journal_event("job.queued", &child, json!({ "retryOf": parent.id }));
        info!(job_id = %child.id, retry_of = %parent.id, "retry child queued");
        Ok(child)
    }

    /// Fail jobs whose `updatedAt` has aged past the watchdog thresholds.
    ///
    /// `running` jobs older than `running_ms` and `cancelling` jobs older
    /// than `cancelling_ms` are failed with `watchdog_timeout`
    /// (non-retryable) and their claim locks released. Returns the failed
    /// jobs.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure.
    pub fn recover_stuck_jobs(
        &self,
        timeouts: WatchdogTimeouts,
    ) -> Result<Vec<Job>, JobStoreError> {
        let running_ms = i64::try_from(timeouts.running_ms)
            .unwrap_or(MAX_WATCHDOG_TIMEOUT_MS)
            .clamp(MIN_RUNNING_TIMEOUT_MS, MAX_WATCHDOG_TIMEOUT_MS);
        let cancelling_ms = i64::try_from(timeouts.cancelling_ms)
            .unwrap_or(MAX_WATCHDOG_TIMEOUT_MS)
            .clamp(MIN_CANCELLING_TIMEOUT_MS, MAX_WATCHDOG_TIMEOUT_MS);

        let now = Utc::now();
        let mut recovered = Vec::new();
        for job in self.load_all()? {
            let threshold_ms = match job.status {
                JobStatus::Running => running_ms,
                JobStatus::Cancelling => cancelling_ms,
                _ => continue,
            };
            let age_ms = now.signed_duration_since(job.updated_at).num_milliseconds();
            if age_ms <= threshold_ms {
                continue;
            }
            warn!(
                job_id = %job.id,
                status = %job.status,
                age_ms,
                "watchdog recovering stuck job"
            );
            let failed = self.fail_job(
                &job.id,
                JobError {
                    code: "watchdog_timeout".to_owned(),
                    message: format!(
                        "no heartbeat for {age_ms} ms in status {}",
                        job.status
                    ),
                    retryable: false,
                },
            )?;
            state::release_lock(&self.paths.lock_file(&job.id));
            recovered.push(failed);
        }
        Ok(recovered)
    }

    /// Count jobs per lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error when the jobs directory cannot be read.
    pub fn status_counts(&self) -> Result<StatusCounts, JobStoreError> {
        let mut counts = StatusCounts::default();
        for job in self.load_all()? {
            match job.status {
                JobStatus::Queued => counts.queued = counts.queued.saturating_add(1),
                JobStatus::Running => counts.running = counts.running.saturating_add(1),
                JobStatus::Cancelling => counts.cancelling = counts.cancelling.saturating_add(1),
                JobStatus::Succeeded => counts.succeeded = counts.succeeded.saturating_add(1),
                JobStatus::Failed => counts.failed = counts.failed.saturating_add(1),
                JobStatus::Cancelled => counts.cancelled = counts.cancelled.saturating_add(1),
            }
        }
        Ok(counts)
    }

    /// Load the receipt for a job, when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure or a corrupt record.
    pub fn get_receipt(&self, job_id: &str) -> Result<Option<Receipt>, JobStoreError> {
        Ok(state::read_json(&self.paths.receipt_file(job_id))?)
    }

    /// Release the claim lock for a job. Safe to call when absent.
    pub fn release_claim(&self, job_id: &str) {
        state::release_lock(&self.paths.lock_file(job_id));
    }

    /// Whether a claim lock file currently exists for the job.
    pub fn claim_held(&self, job_id: &str) -> bool {
        self.paths.lock_file(job_id).exists()
    }

    fn require(&self, id: &str) -> Result<Job, JobStoreError> {
        self.get_job(id)?
            .ok_or_else(|| JobStoreError::NotFound(id.to_owned()))
    }

    fn load_all(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = Vec::new();
        for path in state::list_record_files(&self.paths.jobs_dir)? {
            match state::read_json::<Job>(&path) {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    // One corrupt record must not take the queue down.
                    warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                }
            }
        }
        Ok(jobs)
    }

    fn write_job(&self, job: &Job) -> Result<(), JobStoreError> {
        Ok(state::write_json_atomic(
            &self.paths.job_file(&job.id),
            job,
        )?)
    }

    fn write_receipt(&self, job: &Job) -> Result<(), JobStoreError> {
        let receipt = Receipt::for_job(job);
        Ok(state::write_json_atomic(
            &self.paths.receipt_file(&job.id),
            &receipt,
        )?)
    }

    fn journal_event(&self, event_type: &str, job: &Job, extra: Value) {
        let mut event = json!({
            "type": event_type,
            "jobId": job.id,
            "jobType": job.job_type,
            "status": job.status,
        });
        if let Some(session_id) = job.session_id() {
            event["sessionId"] = Value::String(session_id.to_owned());
        }
        if let (Some(event_map), Some(extra_map)) = (event.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                event_map.insert(k.clone(), v.clone());
            }
        }
        if let Err(e) = self.journal.append(&event) {
            warn!(error = %e, event_type, "failed to journal job event");
        }
    }
}
