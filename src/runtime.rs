//! Runtime wiring: builds every component over one state directory and
//! owns the long-running loops.
//!
//! The composition rules live here so the stores stay decoupled: worker
//! status events fan out into notifications and conversation events, the
//! reminder dispatcher feeds the notification queue, and the gateway sees
//! one facade over the whole fabric.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::ChannelAdapter;
use crate::approvals::ApprovalStore;
use crate::builtins::{NoteStore, TaskItemStore};
use crate::config::Config;
use crate::dedupe::DedupeStore;
use crate::events::{ConversationLog, NewConversationEvent, StreamConfig};
use crate::gateway::Gateway;
use crate::http::AppState;
use crate::jobs::{
    JobStore, StatusEvent, StatusKind, StatusSink, WatchdogTimeouts, WorkerPool, WorkerPoolConfig,
};
use crate::outbound::{NewNotification, NotificationDispatcher, NotificationStore};
use crate::processors::{JobRouter, StubTaskProcessor};
use crate::reminders::{ReminderDispatcher, ReminderStore};
use crate::runspec::{RunSpecProcessor, RunSpecStore};
use crate::services::LlmService;
use crate::state::{EventJournal, StatePaths};

/// Interval between conversation-log retention sweeps.
const PRUNE_INTERVAL_MS: u64 = 60_000;

/// Fully wired service instance.
pub struct Runtime {
    /// Resolved configuration.
    pub config: Config,
    /// State directory layout.
    pub paths: Arc<StatePaths>,
    /// Job store.
    pub jobs: Arc<JobStore>,
    /// Approval store.
    pub approvals: Arc<ApprovalStore>,
    /// Run-spec store.
    pub runs: Arc<RunSpecStore>,
    /// Notification store.
    pub notifications: Arc<NotificationStore>,
    /// Reminder store.
    pub reminders: Arc<ReminderStore>,
    /// Conversation log.
    pub conversation: Arc<ConversationLog>,
    /// Inbound dedupe store.
    pub dedupe: Arc<DedupeStore>,
    /// Notes store.
    pub notes: Arc<NoteStore>,
    /// Task item store.
    pub tasks: Arc<TaskItemStore>,
    /// Gateway facade.
    pub gateway: Arc<Gateway>,
    worker_pool: WorkerPool,
    notification_dispatcher: NotificationDispatcher,
    reminder_dispatcher: ReminderDispatcher,
    pruner_active: Arc<AtomicBool>,
    pruner_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build every component over `config.state_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory cannot be created —
    /// an unrecoverable startup failure.
    pub fn build(
        config: Config,
        adapter: Arc<dyn ChannelAdapter>,
        llm: Option<Arc<dyn LlmService>>,
    ) -> anyhow::Result<Self> {
        let paths = Arc::new(StatePaths::new(config.state_dir.clone()));
        paths
            .ensure_layout()
            .with_context(|| format!("state directory {} is unusable", paths.root.display()))?;

        let journal = Arc::new(EventJournal::new(paths.events_log.clone()));
        let jobs = Arc::new(JobStore::new(Arc::clone(&paths), Arc::clone(&journal)));
        let approvals = Arc::new(ApprovalStore::new(
            Arc::clone(&paths),
            config.approval_ttl_ms,
        ));
        let runs = Arc::new(RunSpecStore::new(Arc::clone(&paths)));
        let notifications = Arc::new(NotificationStore::new(Arc::clone(&paths)));
        let reminders = Arc::new(ReminderStore::new(Arc::clone(&paths)));
        let dedupe = Arc::new(DedupeStore::new(
            Arc::clone(&paths),
            config.dedupe_window_ms,
        ));
        let notes = Arc::new(NoteStore::new(Arc::clone(&paths)));
        let tasks = Arc::new(TaskItemStore::new(Arc::clone(&paths)));
        let conversation = Arc::new(ConversationLog::new(
            Arc::clone(&journal),
            StreamConfig {
                max_events: config.stream_max_events,
                retention_days: config.stream_retention_days,
                dedupe_window_ms: config.stream_dedupe_window_ms,
            },
        ));

        let mut gateway = Gateway::new(
            Arc::clone(&jobs),
            Arc::clone(&approvals),
            Arc::clone(&runs),
            Arc::clone(&notifications),
            Arc::clone(&conversation),
            Arc::clone(&dedupe),
        );
        if let Some(llm) = llm {
            gateway = gateway.with_llm(llm);
        }
        if let Some(base_url) = &config.public_base_url {
            gateway = gateway.with_public_base_url(base_url.clone());
        }
        let gateway = Arc::new(gateway);

        let router = JobRouter::new()
            .register("stub_task", Arc::new(StubTaskProcessor))
            .register(
                "run_spec",
                Arc::new(RunSpecProcessor::new(
                    Arc::clone(&runs),
                    Arc::clone(&notifications),
                    Arc::clone(&paths),
                )),
            );

        let on_status = status_sink(Arc::clone(&notifications), Arc::clone(&conversation));
        let worker_pool = WorkerPool::new(
            Arc::clone(&jobs),
            Arc::new(router),
            on_status,
            WorkerPoolConfig {
                worker_count: config.worker_count,
                poll_interval_ms: config.worker_poll_ms,
                watchdog: WatchdogTimeouts {
                    running_ms: config.running_timeout_ms,
                    cancelling_ms: config.cancelling_timeout_ms,
                },
            },
        );

        let notification_dispatcher = NotificationDispatcher::new(
            Arc::clone(&notifications),
            adapter,
            config.notification_poll_ms,
        );
        let reminder_dispatcher = ReminderDispatcher::new(
            Arc::clone(&reminders),
            Arc::clone(&notifications),
            config.reminder_poll_ms,
        );

        Ok(Self {
            config,
            paths,
            jobs,
            approvals,
            runs,
            notifications,
            reminders,
            conversation,
            dedupe,
            notes,
            tasks,
            gateway,
            worker_pool,
            notification_dispatcher,
            reminder_dispatcher,
            pruner_active: Arc::new(AtomicBool::new(false)),
            pruner_handle: Mutex::new(None),
        })
    }

    /// Start the worker pool, both dispatchers, and the retention pruner.
    pub fn start(&self) {
        self.worker_pool.start();
        self.notification_dispatcher.start();
        self.reminder_dispatcher.start();

        self.pruner_active.store(true, Ordering::SeqCst);
        let active = Arc::clone(&self.pruner_active);
        let conversation = Arc::clone(&self.conversation);
        let handle = tokio::spawn(async move {
            debug!("event pruner starting");
            while active.load(Ordering::SeqCst) {
                conversation.prune_now();
                tokio::time::sleep(Duration::from_millis(PRUNE_INTERVAL_MS)).await;
            }
            debug!("event pruner exited");
        });
        if let Ok(mut slot) = self.pruner_handle.lock() {
            *slot = Some(handle);
        }
        info!(state_dir = %self.paths.root.display(), "runtime started");
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.worker_pool.shutdown().await;
        self.notification_dispatcher.shutdown().await;
        self.reminder_dispatcher.shutdown().await;

        self.pruner_active.store(false, Ordering::SeqCst);
        let handle = self.pruner_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("runtime stopped");
    }

    /// Shared state for the HTTP layer.
    pub fn app_state(&self) -> AppState {
        AppState {
            gateway: Arc::clone(&self.gateway),
            jobs: Arc::clone(&self.jobs),
            approvals: Arc::clone(&self.approvals),
            runs: Arc::clone(&self.runs),
            conversation: Arc::clone(&self.conversation),
            notes: Arc::clone(&self.notes),
            tasks: Arc::clone(&self.tasks),
            reminders: Arc::clone(&self.reminders),
            baileys_inbound_token: self.config.baileys_inbound_token.clone(),
        }
    }
}

/// Build the status sink that turns worker events into notifications and
/// conversation events.
fn status_sink(
    notifications: Arc<NotificationStore>,
    conversation: Arc<ConversationLog>,
) -> StatusSink {
    Arc::new(move |event: StatusEvent| {
        let text = describe_status(&event);

        if let Some(session_id) = &event.session_id {
            conversation.add(NewConversationEvent {
                session_id: session_id.clone(),
                source: "worker".to_owned(),
                channel: "internal".to_owned(),
                direction: "outbound".to_owned(),
                kind: "job_status".to_owned(),
                text: text.clone(),
                metadata: Value::Null,
            });

            if let Some(body) = notification_text(&event) {
                let mut params = NewNotification::text(session_id.clone(), body);
                params.job_id = Some(event.job_id.clone());
                params.status = Some(event.kind.as_str().to_owned());
                if let Err(e) = notifications.enqueue(params) {
                    warn!(job_id = %event.job_id, error = %e, "status notification failed");
                }
            }
        }
    })
}

/// One-line description of a status event for the conversation log.
fn describe_status(event: &StatusEvent) -> String {
    match &event.summary {
        Some(summary) => format!("job {} {}: {summary}", event.job_id, event.kind.as_str()),
        None => format!("job {} {}", event.job_id, event.kind.as_str()),
    }
}

/// Chat-facing notification body for terminal status events.
///
/// Running and progress events stay out of the chat channel; the
/// conversation log and SSE stream carry them for observers.
fn notification_text(event: &StatusEvent) -> Option<String> {
    match event.kind {
        StatusKind::Succeeded => Some(
            event
                .response_text
                .clone()
                .or_else(|| event.summary.clone())
                .unwrap_or_else(|| format!("Job {} succeeded.", event.job_id)),
        ),
        StatusKind::Failed => {
            let reason = event
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .or_else(|| event.summary.clone())
                .unwrap_or_else(|| "unknown error".to_owned());
            Some(format!("Job {} failed: {reason}", event.job_id))
        }
        StatusKind::Cancelled => Some(format!("Job {} was cancelled.", event.job_id)),
        StatusKind::Running | StatusKind::Progress => None,
    }
}
