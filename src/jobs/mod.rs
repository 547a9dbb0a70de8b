//! Durable jobs: records, receipts, the store, and the worker pool.
//!
//! A [`Job`] is the unit of asynchronous work. Its lifecycle is a strict
//! state machine:
//!
//! ```text
//! queued ──► running ──► succeeded | failed
//!   │           │
//!   │           ▼
//!   └──► cancelled ◄── cancelling ──► failed (watchdog)
//! ```
//!
//! Terminal jobs are immutable except for spawning a retry child that
//! points back via `retryOf`. Every terminal transition produces exactly
//! one [`Receipt`].

pub mod store;
pub mod worker;

pub use store::{CreateJob, JobStore, JobStoreError, StatusCounts, WatchdogTimeouts};
pub use worker::{
    ProcessContext, Processor, StatusEvent, StatusKind, StatusSink, WorkerPool, WorkerPoolConfig,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed and executing.
    Running,
    /// Cancellation requested while running; worker will observe it.
    Cancelling,
    /// Terminal: cancelled before start or after a cooperative stop.
    Cancelled,
    /// Terminal: processor returned a result.
    Succeeded,
    /// Terminal: processor or watchdog failure.
    Failed,
}

impl JobStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Succeeded | Self::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent progress report persisted on a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// When the report was made.
    pub at: DateTime<Utc>,
    /// Human-readable progress line.
    pub message: String,
    /// Optional step identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Optional completion percentage, clamped to `[0, 100]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Optional coarse phase label; empty strings are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Optional structured detail payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Structured failure recorded on a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    /// Stable error code (e.g. `processor_failure`, `watchdog_timeout`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether a retry may succeed.
    pub retryable: bool,
}

/// Durable unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque UUID record id.
    pub id: String,
    /// Processor routing key (e.g. `stub_task`, `run_spec`).
    #[serde(rename = "type")]
    pub job_type: String,
    /// Free-form payload mapping.
    #[serde(default)]
    pub payload: Value,
    /// Scheduling priority; lower is more urgent. Ties break on `createdAt`.
    pub priority: i64,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time; monotonically non-decreasing.
    pub updated_at: DateTime<Utc>,
    /// Set when a worker claims the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Worker that claimed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Parent job id when this job is a retry child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    /// Skill hint carried through from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_skill: Option<String>,
    /// Latest progress report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    /// Free-form result written on success (and preserved on a
    /// cancelled-during-run job).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details written on `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Job {
    /// Session the job belongs to, probed from the payload.
    pub fn session_id(&self) -> Option<&str> {
        self.payload.get("sessionId").and_then(Value::as_str)
    }

    /// Retry attempt number carried in the payload (0 for the original).
    pub fn retry_attempt(&self) -> u64 {
        self.payload
            .get("retryAttempt")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Maximum retries requested in the payload (0 disables retries).
    pub fn max_retries(&self) -> u64 {
        self.payload
            .get("maxRetries")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Receipt status: the audit-level summary of how a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    /// Job succeeded.
    Success,
    /// Job was still in flight when the receipt view was taken.
    Partial,
    /// Job failed.
    Failed,
    /// Job was cancelled.
    Cancelled,
}

impl From<JobStatus> for ReceiptStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Succeeded => Self::Success,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
            JobStatus::Queued | JobStatus::Running | JobStatus::Cancelling => Self::Partial,
        }
    }
}

/// One entry in a receipt's ordered action trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptAction {
    /// When the action happened.
    pub at: DateTime<Utc>,
    /// Action marker (`queued`, `started`, terminal status).
    pub action: String,
}

/// Audit record emitted on a job's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Id of the job this receipt describes.
    pub job_id: String,
    /// Processor routing key of the job.
    pub job_type: String,
    /// Audit-level outcome.
    pub status: ReceiptStatus,
    /// Session the job belonged to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Job creation time.
    pub created_at: DateTime<Utc>,
    /// Claim time, when the job ever started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// `max(0, endedAt - startedAt)` in milliseconds, when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Ordered action trail.
    pub actions: Vec<ReceiptAction>,
    /// Failure details for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Receipt {
    /// Build the audit view of a job.
    pub fn for_job(job: &Job) -> Self {
        let mut actions = vec![ReceiptAction {
            at: job.created_at,
            action: "queued".to_owned(),
        }];
        if let Some(started_at) = job.started_at {
            actions.push(ReceiptAction {
                at: started_at,
                action: "started".to_owned(),
            });
        }
        if let Some(ended_at) = job.ended_at {
            actions.push(ReceiptAction {
                at: ended_at,
                action: job.status.as_str().to_owned(),
            });
        }

        let duration_ms = match (job.started_at, job.ended_at) {
            (Some(started), Some(ended)) => {
                Some(ended.signed_duration_since(started).num_milliseconds().max(0))
            }
            _ => None,
        };

        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            status: ReceiptStatus::from(job.status),
            session_id: job.session_id().map(str::to_owned),
            created_at: job.created_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
            duration_ms,
            actions,
            error: job.error.clone(),
        }
    }
}
