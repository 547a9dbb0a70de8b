//! Worker pool: claims queued jobs, runs the processor, reports status.
//!
//! Each worker is an independent polling task. One loop iteration runs the
//! watchdog sweep, claims at most one job, executes the processor callback,
//! and finalizes the record — observing a cooperative cancellation if one
//! arrived while the processor was running. The claim lock is released on
//! every exit path.
//!
//! Workers never enforce per-job deadlines themselves; a processor that
//! never returns loses its job to the watchdog on a later sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError, WatchdogTimeouts, RETRY_HARD_CAP};
use super::{Job, JobError, JobProgress, JobStatus};

/// Error-message fragments that mark a processor failure as retryable.
const RETRYABLE_FRAGMENTS: [&str; 7] = [
    "timeout",
    "timed out",
    "fetch failed",
    "network",
    "temporarily unavailable",
    "rate limit",
    "429",
];

/// Lifecycle notifications emitted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// A worker claimed the job.
    Running,
    /// The processor reported progress (or a retry child was queued).
    Progress,
    /// The job completed successfully.
    Succeeded,
    /// The job failed terminally (no retry child queued).
    Failed,
    /// The job was cancelled after the processor returned.
    Cancelled,
}

impl StatusKind {
    /// Wire name of the status event.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Progress => "progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A status change observed by the pool, handed to the runtime wiring.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Job the event concerns.
    pub job_id: String,
    /// Session probed from the job payload.
    pub session_id: Option<String>,
    /// What happened.
    pub kind: StatusKind,
    /// Short human-readable summary.
    pub summary: Option<String>,
    /// Chat-ready response text pulled from the result, when present.
    pub response_text: Option<String>,
    /// Progress step identifier (`retrying` for retry children).
    pub step: Option<String>,
    /// Progress percentage.
    pub percent: Option<f64>,
    /// Progress phase label.
    pub phase: Option<String>,
    /// Structured progress details.
    pub details: Option<Value>,
    /// Failure details on `failed` events.
    pub error: Option<JobError>,
}

impl StatusEvent {
    fn bare(job: &Job, kind: StatusKind) -> Self {
        Self {
            job_id: job.id.clone(),
            session_id: job.session_id().map(str::to_owned),
            kind,
            summary: None,
            response_text: None,
            step: None,
            percent: None,
            phase: None,
            details: None,
            error: None,
        }
    }
}

/// Callback invoked for every status change.
pub type StatusSink = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Collaborator that executes a claimed job.
///
/// The returned map may carry `summary` and `responseText` strings, which
/// the pool surfaces on the `succeeded` status event.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Execute `job`, reporting progress through `ctx`.
    async fn process(&self, job: &Job, ctx: &ProcessContext) -> anyhow::Result<Value>;
}

/// Progress-reporting handle passed to the processor.
pub struct ProcessContext {
    store: Arc<JobStore>,
    on_status: StatusSink,
    job_id: String,
    session_id: Option<String>,
}

impl ProcessContext {
    /// Persist a progress report and emit a `progress` status event.
    ///
    /// # Errors
    ///
    /// Returns an error when the job record cannot be updated.
    pub fn report_progress(&self, progress: JobProgress) -> Result<(), JobStoreError> {
        let updated = self.store.update_job_progress(&self.job_id, progress)?;
        let stored = updated.progress.as_ref();
        (self.on_status)(StatusEvent {
            job_id: self.job_id.clone(),
            session_id: self.session_id.clone(),
            kind: StatusKind::Progress,
            summary: stored.map(|p| p.message.clone()),
            response_text: None,
            step: stored.and_then(|p| p.step.clone()),
            percent: stored.and_then(|p| p.percent),
            phase: stored.and_then(|p| p.phase.clone()),
            details: stored.and_then(|p| p.details.clone()),
            error: None,
        });
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker tasks.
    pub worker_count: usize,
    /// Sleep between empty polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Watchdog thresholds applied on every loop iteration.
    pub watchdog: WatchdogTimeouts,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            poll_interval_ms: 250,
            watchdog: WatchdogTimeouts::default(),
        }
    }
}

/// Pool of polling workers draining the job store.
pub struct WorkerPool {
    store: Arc<JobStore>,
    processor: Arc<dyn Processor>,
    on_status: StatusSink,
    config: WorkerPoolConfig,
    active: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool. Nothing runs until [`WorkerPool::start`].
    pub fn new(
        store: Arc<JobStore>,
        processor: Arc<dyn Processor>,
        on_status: StatusSink,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            processor,
            on_status,
            config,
            active: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks.
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
        let count = self.config.worker_count.max(1);
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for n in 0..count {
            let worker_id = format!("worker-{n}");
            let store = Arc::clone(&self.store);
            let processor = Arc::clone(&self.processor);
            let on_status = Arc::clone(&self.on_status);
            let active = Arc::clone(&self.active);
            let config = self.config;
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, store, processor, on_status, active, config).await;
            }));
        }
        info!(workers = count, "worker pool started");
    }

    /// Request a cooperative stop. Loops exit after the current job and
    /// the next poll sleep.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stop and wait for every worker task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task join failed");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    worker_id: String,
    store: Arc<JobStore>,
    processor: Arc<dyn Processor>,
    on_status: StatusSink,
    active: Arc<AtomicBool>,
    config: WorkerPoolConfig,
) {
    debug!(worker_id, "worker loop starting");
    while active.load(Ordering::SeqCst) {
        sweep_watchdog(&store, &on_status, config.watchdog);

        let claimed = match store.claim_next_queued_job(&worker_id) {
            Ok(job) => job,
            Err(e) => {
                error!(worker_id, error = %e, "claim failed");
                None
            }
        };

        match claimed {
            Some(job) => {
                execute_job(&store, processor.as_ref(), &on_status, job).await;
            }
            None => {
                tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
            }
        }
    }
    debug!(worker_id, "worker loop exited");
}

/// Run one watchdog sweep and emit `failed` events for recovered jobs.
fn sweep_watchdog(store: &JobStore, on_status: &StatusSink, timeouts: WatchdogTimeouts) {
    match store.recover_stuck_jobs(timeouts) {
        Ok(recovered) => {
            for job in recovered {
                let mut event = StatusEvent::bare(&job, StatusKind::Failed);
                event.summary = Some("recovered by watchdog".to_owned());
                event.error = job.error.clone();
                on_status(event);
            }
        }
        Err(e) => error!(error = %e, "watchdog sweep failed"),
    }
}

async fn execute_job(
    store: &Arc<JobStore>,
    processor: &dyn Processor,
    on_status: &StatusSink,
    job: Job,
) {
    on_status(StatusEvent::bare(&job, StatusKind::Running));

    let ctx = ProcessContext {
        store: Arc::clone(store),
        on_status: Arc::clone(on_status),
        job_id: job.id.clone(),
        session_id: job.session_id().map(str::to_owned),
    };

    let outcome = processor.process(&job, &ctx).await;

    match outcome {
        Ok(result) => finalize_success(store, on_status, &job, result),
        Err(e) => finalize_failure(store, on_status, &job, &e),
    }

    store.release_claim(&job.id);
}

fn finalize_success(store: &JobStore, on_status: &StatusSink, job: &Job, result: Value) {
    // Re-read: a cancel may have arrived while the processor ran, or the
    // watchdog may have failed the job under a stalled heartbeat.
    let fresh = match store.get_job(&job.id) {
        Ok(Some(fresh)) => fresh,
        Ok(None) => {
            warn!(job_id = %job.id, "job record vanished during run");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "re-read after run failed");
            return;
        }
    };

    match fresh.status {
        JobStatus::Cancelling => match store.mark_cancelled_after_run(&job.id, Some(result)) {
            Ok(done) => on_status(StatusEvent::bare(&done, StatusKind::Cancelled)),
            Err(e) => error!(job_id = %job.id, error = %e, "cancel finalization failed"),
        },
        JobStatus::Running => match store.complete_job(&job.id, result) {
            Ok(done) => {
                let mut event = StatusEvent::bare(&done, StatusKind::Succeeded);
                event.summary = probe_string(done.result.as_ref(), "summary");
                event.response_text = probe_string(done.result.as_ref(), "responseText");
                on_status(event);
            }
            Err(e) => error!(job_id = %job.id, error = %e, "completion failed"),
        },
        other => {
            // Watchdog recovery already emitted the terminal event.
            debug!(job_id = %job.id, status = %other, "job finalized elsewhere");
        }
    }
}

fn finalize_failure(
    store: &JobStore,
    on_status: &StatusSink,
    job: &Job,
    cause: &anyhow::Error,
) {
    let message = cause.to_string();
    let retryable = is_retryable_message(&message);
    let code = if retryable {
        "processor_retryable_failure"
    } else {
        "processor_failure"
    };

    let failed = match store.fail_job(
        &job.id,
        JobError {
            code: code.to_owned(),
            message: message.clone(),
            retryable,
        },
    ) {
        Ok(failed) => failed,
        Err(e) => {
            // Terminal already (watchdog) — nothing more to record.
            debug!(job_id = %job.id, error = %e, "failure finalized elsewhere");
            return;
        }
    };

    let attempt = failed.retry_attempt();
    let allowed = failed.max_retries().min(RETRY_HARD_CAP);
    if retryable && attempt < allowed {
        match store.retry_job(&failed.id) {
            Ok(child) => {
                let mut event = StatusEvent::bare(&failed, StatusKind::Progress);
                event.step = Some("retrying".to_owned());
                event.summary = Some(format!(
                    "retrying as job {} (attempt {})",
                    child.id,
                    child.retry_attempt()
                ));
                on_status(event);
            }
            Err(e) => {
                error!(job_id = %failed.id, error = %e, "retry spawn failed");
                let mut event = StatusEvent::bare(&failed, StatusKind::Failed);
                event.error = failed.error.clone();
                on_status(event);
            }
        }
    } else {
        let mut event = StatusEvent::bare(&failed, StatusKind::Failed);
        event.summary = Some(message);
        event.error = failed.error.clone();
        on_status(event);
    }
}

/// Whether a processor error message indicates a transient condition.
fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RETRYABLE_FRAGMENTS.iter().any(|f| lowered.contains(f))
}

fn probe_string(value: Option<&Value>, key: &str) -> Option<String> {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_matches_fragments() {
        assert!(is_retryable_message("upstream fetch failed hard"));
        assert!(is_retryable_message("Request Timed Out"));
        assert!(is_retryable_message("HTTP 429 from provider"));
        assert!(is_retryable_message("rate limit exceeded"));
        assert!(!is_retryable_message("invalid payload shape"));
        assert!(!is_retryable_message("division by zero"));
    }

    #[test]
    fn probe_string_reads_result_fields() {
        let result = serde_json::json!({"summary": "done", "responseText": 7});
        assert_eq!(
            probe_string(Some(&result), "summary").as_deref(),
            Some("done")
        );
        // Non-string values are ignored.
        assert_eq!(probe_string(Some(&result), "responseText"), None);
        assert_eq!(probe_string(None, "summary"), None);
    }
}
