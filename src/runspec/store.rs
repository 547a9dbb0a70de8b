//! Run-spec store: one JSON record per run under `builtins/run_specs/`.
//!
//! [`RunSpecStore::put`] is the only way to create a record, and the
//! stored plan is immutable afterwards. Every mutation appends to the
//! run's timeline with the next gap-free `seq` and rewrites the record
//! atomically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::{self, StateError, StatePaths};

use super::{
    RunEvent, RunEventType, RunSpec, RunSpecRecord, RunStatus, StepState, StepStatus,
};

/// Errors raised by the run-spec store.
#[derive(Debug, Error)]
pub enum RunSpecStoreError {
    /// On-disk primitive failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// No run with the given id.
    #[error("run not found: {0}")]
    NotFound(String),
    /// No step with the given id in the run's plan.
    #[error("run {run_id} has no step {step_id}")]
    StepNotFound {
        /// Run id.
        run_id: String,
        /// Unknown step id.
        step_id: String,
    },
    /// A put attempted to change the stored plan.
    #[error("run {0}: spec is immutable once stored")]
    SpecImmutable(String),
}

/// Parameters for creating (or re-putting) a run record.
#[derive(Debug, Clone)]
pub struct PutRunSpec {
    /// Run id (caller-chosen, typically a UUID).
    pub run_id: String,
    /// Session the run belongs to.
    pub session_id: String,
    /// The plan. Immutable once stored.
    pub spec: RunSpec,
    /// Initial (or updated) run status.
    pub status: RunStatus,
    /// Step ids pre-approved by the caller.
    pub approved_step_ids: Vec<String>,
    /// Job driving the run, when known.
    pub job_id: Option<String>,
}

/// Parameters for a step state transition.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    /// New status.
    pub status: Option<StepStatus>,
    /// Operator-facing message.
    pub message: Option<String>,
    /// Handler output.
    pub output: Option<Value>,
    /// Attempt counter override.
    pub attempts: Option<u32>,
}

/// Parameters for appending a timeline event.
#[derive(Debug, Clone)]
pub struct NewRunEvent {
    /// Event type.
    pub event_type: RunEventType,
    /// Step the event concerns.
    pub step_id: Option<String>,
    /// Human-readable message.
    pub message: Option<String>,
    /// Structured payload.
    pub payload: Option<Value>,
}

/// Durable run-spec store over the state directory.
#[derive(Debug)]
pub struct RunSpecStore {
    paths: Arc<StatePaths>,
    // Serializes read-modify-write cycles so `seq` stays gap-free.
    write_lock: Mutex<()>,
}

impl RunSpecStore {
    /// Create a store handle.
    pub fn new(paths: Arc<StatePaths>) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a run record, or update the mutable fields of an existing one.
    ///
    /// On first put, step states are derived from the plan and the
    /// approved set, and a `started` event is appended with `seq = 1`. On
    /// a re-put the stored plan must be identical; status, job binding,
    /// and newly approved step ids are merged in.
    ///
    /// # Errors
    ///
    /// Returns [`RunSpecStoreError::SpecImmutable`] when a re-put carries
    /// a different plan.
    pub fn put(&self, params: PutRunSpec) -> Result<RunSpecRecord, RunSpecStoreError> {
        let guard = self.lock();
        let now = Utc::now();

        let record = match self.load(&params.run_id)? {
            Some(mut existing) => {
                if existing.spec != params.spec {
                    return Err(RunSpecStoreError::SpecImmutable(params.run_id));
                }
                existing.status = params.status;
                if params.job_id.is_some() {
                    existing.job_id = params.job_id;
                }
                for step_id in params.approved_step_ids {
                    if !existing.is_step_approved(&step_id) {
                        existing.approved_step_ids.push(step_id);
                    }
                }
                existing.updated_at = now;
                existing
            }
            None => {
                let mut step_states = BTreeMap::new();
                for step in &params.spec.steps {
                    let initial = if step.requires_approval() {
                        if params.approved_step_ids.iter().any(|id| id == &step.id) {
                            StepStatus::Approved
                        } else {
                            StepStatus::ApprovalRequired
                        }
                    } else {
                        StepStatus::Pending
                    };
                    step_states.insert(step.id.clone(), StepState::new(initial));
                }

                let mut record = RunSpecRecord {
                    run_id: params.run_id,
                    session_id: params.session_id,
                    job_id: params.job_id,
                    status: params.status,
                    spec: params.spec,
                    approved_step_ids: params.approved_step_ids,
                    step_states,
                    events: Vec::new(),
                    created_at: now,
                    updated_at: now,
                };
                push_event(
                    &mut record,
                    NewRunEvent {
                        event_type: RunEventType::Started,
                        step_id: None,
                        message: Some("run created".to_owned()),
                        payload: None,
                    },
                );
                info!(run_id = %record.run_id, steps = record.spec.steps.len(), "run spec stored");
                record
            }
        };

        self.save(&record)?;
        drop(guard);
        Ok(record)
    }

    /// Load a run by id.
    ///
    /// # Errors
    ///
    /// Returns an error on filesystem failure or a corrupt record.
    pub fn get(&self, run_id: &str) -> Result<Option<RunSpecRecord>, RunSpecStoreError> {
        self.load(run_id)
    }

    /// Runs for a session, newest first, bounded to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be read.
    pub fn list_by_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<RunSpecRecord>, RunSpecStoreError> {
        let mut runs = Vec::new();
        for path in state::list_record_files(&self.paths.run_specs_dir)? {
            if let Some(record) = state::read_json::<RunSpecRecord>(&path)? {
                if record.session_id == session_id {
                    runs.push(record);
                }
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.run_id.cmp(&b.run_id)));
        runs.truncate(limit.clamp(1, 500));
        Ok(runs)
    }

    /// Set the run status, appending a matching terminal event (or a
    /// `note` for non-terminal statuses).
    ///
    /// # Errors
    ///
    /// Returns [`RunSpecStoreError::NotFound`] for an unknown run.
    pub fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        message: Option<String>,
        payload: Option<Value>,
    ) -> Result<RunSpecRecord, RunSpecStoreError> {
        let guard = self.lock();
        let mut record = self.require(run_id)?;
        record.status = status;
        record.updated_at = Utc::now();

        let event_type = match status {
            RunStatus::Completed => RunEventType::Completed,
            RunStatus::Failed => RunEventType::Failed,
            RunStatus::Cancelled => RunEventType::Cancelled,
            RunStatus::Queued | RunStatus::AwaitingApproval | RunStatus::Running => {
                RunEventType::Note
            }
        };
        push_event(
            &mut record,
            NewRunEvent {
                event_type,
                step_id: None,
                message,
                payload,
            },
        );

        self.save(&record)?;
        drop(guard);
        Ok(record)
    }

    /// Append a timeline event with the next `seq`.
    ///
    /// # Errors
    ///
    /// Returns [`RunSpecStoreError::NotFound`] for an unknown run.
    pub fn append_event(
        &self,
        run_id: &str,
        event: NewRunEvent,
    ) -> Result<RunSpecRecord, RunSpecStoreError> {
        let guard = self.lock();
        let mut record = self.require(run_id)?;
        push_event(&mut record, event);
        record.updated_at = Utc::now();
        self.save(&record)?;
        drop(guard);
        Ok(record)
    }

    /// Apply a step transition and append the `step_status` event.
    ///
    /// Entering `running` stamps `startedAt` on first use; entering a
    /// terminal status stamps `endedAt` (backfilling `startedAt` when the
    /// step never visibly ran).
    ///
    /// # Errors
    ///
    /// Returns [`RunSpecStoreError::StepNotFound`] when the plan has no
    /// such step.
    pub fn update_step(
        &self,
        run_id: &str,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<RunSpecRecord, RunSpecStoreError> {
        let guard = self.lock();
        let mut record = self.require(run_id)?;
        let now = Utc::now();

        let state = record.step_states.get_mut(step_id).ok_or_else(|| {
            RunSpecStoreError::StepNotFound {
                run_id: run_id.to_owned(),
                step_id: step_id.to_owned(),
            }
        })?;

        if let Some(status) = update.status {
            state.status = status;
            if status == StepStatus::Running && state.started_at.is_none() {
                state.started_at = Some(now);
            }
            if status.is_terminal() {
                state.ended_at = Some(now);
                if state.started_at.is_none() {
                    state.started_at = Some(now);
                }
            }
        }
        if let Some(message) = update.message {
            state.message = Some(message);
        }
        if let Some(output) = update.output {
            state.output = Some(output);
        }
        if let Some(attempts) = update.attempts {
            state.attempts = attempts;
        }
        let status_now = state.status;

        push_event(
            &mut record,
            NewRunEvent {
                event_type: RunEventType::StepStatus,
                step_id: Some(step_id.to_owned()),
                message: None,
                payload: Some(json!({ "status": status_now })),
            },
        );
        record.updated_at = now;

        self.save(&record)?;
        drop(guard);
        debug!(run_id, step_id, status = ?status_now, "step updated");
        Ok(record)
    }

    /// Grant approval for a step.
    ///
    /// Adds the id to the approved set; a step still in
    /// `approval_required` (or `pending`) moves to `approved` with the
    /// message "Approved by user". Appends an `approval_granted` event.
    ///
    /// # Errors
    ///
    /// Returns [`RunSpecStoreError::StepNotFound`] when the plan has no
    /// such step.
    pub fn grant_step_approval(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<RunSpecRecord, RunSpecStoreError> {
        let guard = self.lock();
        let mut record = self.require(run_id)?;

        if !record.spec.steps.iter().any(|s| s.id == step_id) {
            return Err(RunSpecStoreError::StepNotFound {
                run_id: run_id.to_owned(),
                step_id: step_id.to_owned(),
            });
        }

        if !record.is_step_approved(step_id) {
            record.approved_step_ids.push(step_id.to_owned());
        }

        if let Some(state) = record.step_states.get_mut(step_id) {
            if matches!(
                state.status,
                StepStatus::ApprovalRequired | StepStatus::Pending
            ) {
                state.status = StepStatus::Approved;
                state.message = Some("Approved by user".to_owned());
            }
        }

        push_event(
            &mut record,
            NewRunEvent {
                event_type: RunEventType::ApprovalGranted,
                step_id: Some(step_id.to_owned()),
                message: None,
                payload: None,
            },
        );
        record.updated_at = Utc::now();

        self.save(&record)?;
        drop(guard);
        info!(run_id, step_id, "step approval granted");
        Ok(record)
    }

    fn require(&self, run_id: &str) -> Result<RunSpecRecord, RunSpecStoreError> {
        self.load(run_id)?
            .ok_or_else(|| RunSpecStoreError::NotFound(run_id.to_owned()))
    }

    fn load(&self, run_id: &str) -> Result<Option<RunSpecRecord>, RunSpecStoreError> {
        Ok(state::read_json(&self.paths.run_spec_file(run_id))?)
    }

    fn save(&self, record: &RunSpecRecord) -> Result<(), RunSpecStoreError> {
        Ok(state::write_json_atomic(
            &self.paths.run_spec_file(&record.run_id),
            record,
        )?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Append an event with the next gap-free sequence number.
fn push_event(record: &mut RunSpecRecord, event: NewRunEvent) {
    let seq = u64::try_from(record.events.len())
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    record.events.push(RunEvent {
        seq,
        at: Utc::now(),
        event_type: event.event_type,
        step_id: event.step_id,
        message: event.message,
        payload: event.payload,
    });
}
