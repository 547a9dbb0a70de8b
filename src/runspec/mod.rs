//! Multi-step run plans with per-step approvals and an append-only timeline.
//!
//! A [`RunSpecRecord`] binds an immutable ordered plan ([`RunSpec`]) to
//! per-step execution state, a set of approved step ids, and a gap-free
//! event timeline. Steps that declare `approval.required` cannot run
//! until a user grants them; the executor enforces that guard.

pub mod executor;
pub mod store;

pub use executor::RunSpecProcessor;
pub use store::{PutRunSpec, RunSpecStore, RunSpecStoreError};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet executed.
    Queued,
    /// Blocked on one or more step approvals.
    AwaitingApproval,
    /// Executor is walking the steps.
    Running,
    /// Every step finished.
    Completed,
    /// A step failed or an approval guard tripped.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

/// Lifecycle states of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started, no approval needed.
    Pending,
    /// Blocked until the user approves it.
    ApprovalRequired,
    /// Approval granted, not started yet.
    Approved,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled with the run.
    Cancelled,
    /// Skipped (no handler, or superseded).
    Skipped,
}

impl StepStatus {
    /// Whether this status ends the step's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// Approval requirement declared on a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepApproval {
    /// Whether the step is gated.
    pub required: bool,
    /// Capability label shown to the approving user (e.g. `file.write`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

/// One step of an immutable plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpecStep {
    /// Step id, unique within the plan.
    pub id: String,
    /// Handler routing key (`note`, `message`, `file.write`, ...).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Human-readable step name.
    pub name: String,
    /// Free-form handler input.
    #[serde(default)]
    pub input: Value,
    /// Optional per-step timeout hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional per-step retry hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Approval gate, when the step is privileged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<StepApproval>,
}

impl RunSpecStep {
    /// Whether this step requires an explicit approval grant.
    pub fn requires_approval(&self) -> bool {
        self.approval.as_ref().is_some_and(|a| a.required)
    }
}

/// Immutable ordered plan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Steps in execution order.
    pub steps: Vec<RunSpecStep>,
}

/// Mutable execution state of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// Current status.
    pub status: StepStatus,
    /// Number of execution attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// First transition to `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Operator-facing message (e.g. "Approved by user").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Handler output for completed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl StepState {
    fn new(status: StepStatus) -> Self {
        Self {
            status,
            attempts: 0,
            started_at: None,
            ended_at: None,
            message: None,
            output: None,
        }
    }
}

/// Timeline event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    /// Run record created.
    Started,
    /// A step changed status.
    StepStatus,
    /// Free-form annotation.
    Note,
    /// The executor hit an unapproved gated step.
    ApprovalRequested,
    /// A step approval was granted.
    ApprovalGranted,
    /// Run completed.
    Completed,
    /// Run failed.
    Failed,
    /// Run cancelled.
    Cancelled,
}

/// One timeline entry. `seq` is monotonic and gap-free per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// 1-based position in the timeline.
    pub seq: u64,
    /// Event time.
    pub at: DateTime<Utc>,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    /// Step the event concerns, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Durable record of a run: plan, state, approvals, timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpecRecord {
    /// Opaque run id.
    pub run_id: String,
    /// Session the run belongs to.
    pub session_id: String,
    /// Job currently driving the run, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Run lifecycle state.
    pub status: RunStatus,
    /// Immutable plan.
    pub spec: RunSpec,
    /// Step ids the user has approved.
    #[serde(default)]
    pub approved_step_ids: Vec<String>,
    /// Execution state per step id.
    #[serde(default)]
    pub step_states: BTreeMap<String, StepState>,
    /// Append-only timeline.
    #[serde(default)]
    pub events: Vec<RunEvent>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl RunSpecRecord {
    /// Whether a step id has been approved.
    pub fn is_step_approved(&self, step_id: &str) -> bool {
        self.approved_step_ids.iter().any(|id| id == step_id)
    }

    /// State of a step, when the plan knows it.
    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }
}
