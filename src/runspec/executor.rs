//! Run-spec executor: the processor behind `run_spec` jobs.
//!
//! Walks the plan in order, enforcing the approval guard before every
//! step: a step still in `approval_required` fails the whole run with
//! `run_spec_approval_missing` and enqueues nothing further. Completed
//! and skipped steps are left alone, so a re-execution after an approval
//! grant resumes where the previous attempt stopped.
//!
//! Built-in step handlers:
//! - `note` — appends a timeline note,
//! - `message` — enqueues a text notification,
//! - `file.write` — writes an artifact under `artifacts/<runId>/` and
//!   enqueues a file notification,
//! - anything else — marks the step `skipped`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::jobs::{Job, JobProgress, ProcessContext, Processor};
use crate::outbound::{NewNotification, NotificationStore};
use crate::state::{self, StatePaths};

use super::store::{NewRunEvent, RunSpecStore, StepUpdate};
use super::{RunEventType, RunSpecRecord, RunSpecStep, RunStatus, StepStatus};

/// Error code carried on runs that hit an unapproved gated step.
pub const APPROVAL_MISSING: &str = "run_spec_approval_missing";

/// Processor that drives plan execution for `run_spec` jobs.
pub struct RunSpecProcessor {
    runs: Arc<RunSpecStore>,
    notifications: Arc<NotificationStore>,
    paths: Arc<StatePaths>,
}

impl RunSpecProcessor {
    /// Create a processor over the given stores.
    pub fn new(
        runs: Arc<RunSpecStore>,
        notifications: Arc<NotificationStore>,
        paths: Arc<StatePaths>,
    ) -> Self {
        Self {
            runs,
            notifications,
            paths,
        }
    }

    fn execute_step(
        &self,
        record: &RunSpecRecord,
        step: &RunSpecStep,
    ) -> anyhow::Result<Value> {
        match step.step_type.as_str() {
            "note" => {
                let message = step
                    .input
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(&step.name)
                    .to_owned();
                self.runs.append_event(
                    &record.run_id,
                    NewRunEvent {
                        event_type: RunEventType::Note,
                        step_id: Some(step.id.clone()),
                        message: Some(message.clone()),
                        payload: None,
                    },
                )?;
                Ok(json!({ "note": message }))
            }
            "message" => {
                let text = step
                    .input
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or(&step.name)
                    .to_owned();
                self.notifications
                    .enqueue(NewNotification::text(record.session_id.clone(), text.clone()))?;
                Ok(json!({ "sent": text }))
            }
            "file.write" => {
                let file_name = step
                    .input
                    .get("name")
                    .and_then(Value::as_str)
                    .map(sanitize_file_name)
                    .unwrap_or_else(|| format!("{}.txt", sanitize_file_name(&step.id)));
                let content = step
                    .input
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                let dir = self.paths.artifacts_dir.join(&record.run_id);
                state::ensure_dir(&dir)?;
                let path = dir.join(&file_name);
                std::fs::write(&path, content).map_err(|e| {
                    anyhow::anyhow!("failed to write artifact {}: {e}", path.display())
                })?;

                let mut params = NewNotification::file(
                    record.session_id.clone(),
                    path.display().to_string(),
                );
                params.file_name = Some(file_name.clone());
                params.caption = Some(step.name.clone());
                self.notifications.enqueue(params)?;

                Ok(json!({ "path": path.display().to_string(), "bytes": content.len() }))
            }
            other => {
                warn!(step_id = %step.id, step_type = other, "no handler for step type");
                Ok(Value::Null)
            }
        }
    }
}

#[async_trait]
impl Processor for RunSpecProcessor {
    async fn process(&self, job: &Job, ctx: &ProcessContext) -> anyhow::Result<Value> {
        let run_id = job
            .payload
            .get("runId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("run_spec job payload is missing runId"))?
            .to_owned();

        let record = self
            .runs
            .get(&run_id)?
            .ok_or_else(|| anyhow::anyhow!("run not found: {run_id}"))?;

        self.runs.put(super::store::PutRunSpec {
            run_id: run_id.clone(),
            session_id: record.session_id.clone(),
            spec: record.spec.clone(),
            status: RunStatus::Running,
            approved_step_ids: Vec::new(),
            job_id: Some(job.id.clone()),
        })?;

        let total = record.spec.steps.len();
        for (index, step) in record.spec.steps.iter().enumerate() {
            // Re-read per step: approvals may land while the run executes.
            let current = self
                .runs
                .get(&run_id)?
                .ok_or_else(|| anyhow::anyhow!("run vanished: {run_id}"))?;
            let step_status = current
                .step_state(&step.id)
                .map(|s| s.status)
                .unwrap_or(StepStatus::Pending);

            if matches!(step_status, StepStatus::Completed | StepStatus::Skipped) {
                continue;
            }

            // Approval guard: a gated, ungranted step fails the run and
            // leaves every step state exactly as it was.
            if step_status == StepStatus::ApprovalRequired {
                self.runs.append_event(
                    &run_id,
                    NewRunEvent {
                        event_type: RunEventType::ApprovalRequested,
                        step_id: Some(step.id.clone()),
                        message: Some(format!(
                            "step {} requires approval ({})",
                            step.id,
                            step.approval
                                .as_ref()
                                .and_then(|a| a.capability.as_deref())
                                .unwrap_or(&step.step_type)
                        )),
                        payload: None,
                    },
                )?;
                self.runs.set_status(
                    &run_id,
                    RunStatus::Failed,
                    Some(APPROVAL_MISSING.to_owned()),
                    Some(json!({ "stepId": step.id })),
                )?;
                anyhow::bail!("{APPROVAL_MISSING}: step {} of run {run_id}", step.id);
            }

            let attempts = current
                .step_state(&step.id)
                .map(|s| s.attempts.saturating_add(1))
                .unwrap_or(1);
            self.runs.update_step(
                &run_id,
                &step.id,
                StepUpdate {
                    status: Some(StepStatus::Running),
                    attempts: Some(attempts),
                    ..StepUpdate::default()
                },
            )?;

            match self.execute_step(&current, step) {
                Ok(Value::Null) => {
                    self.runs.update_step(
                        &run_id,
                        &step.id,
                        StepUpdate {
                            status: Some(StepStatus::Skipped),
                            message: Some(format!("no handler for step type {}", step.step_type)),
                            ..StepUpdate::default()
                        },
                    )?;
                }
                Ok(output) => {
                    self.runs.update_step(
                        &run_id,
                        &step.id,
                        StepUpdate {
                            status: Some(StepStatus::Completed),
                            output: Some(output),
                            ..StepUpdate::default()
                        },
                    )?;
                }
                Err(e) => {
                    self.runs.update_step(
                        &run_id,
                        &step.id,
                        StepUpdate {
                            status: Some(StepStatus::Failed),
                            message: Some(e.to_string()),
                            ..StepUpdate::default()
                        },
                    )?;
                    self.runs.set_status(
                        &run_id,
                        RunStatus::Failed,
                        Some(format!("step {} failed: {e}", step.id)),
                        None,
                    )?;
                    return Err(e);
                }
            }

            let done = index.saturating_add(1);
            let percent = percent_of(done, total);
            if let Err(e) = ctx.report_progress(JobProgress {
                at: Utc::now(),
                message: format!("step {} of {total} done: {}", done, step.name),
                step: Some(step.id.clone()),
                percent: Some(percent),
                phase: Some("executing".to_owned()),
                details: None,
            }) {
                warn!(run_id = %run_id, error = %e, "progress report failed");
            }
        }

        self.runs
            .set_status(&run_id, RunStatus::Completed, None, None)?;
        info!(run_id = %run_id, steps = total, "run completed");

        Ok(json!({
            "runId": run_id,
            "steps": total,
            "summary": format!("run {run_id} completed ({total} steps)"),
        }))
    }
}

/// Completion percentage of `done` out of `total` steps.
fn percent_of(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let done = u32::try_from(done).unwrap_or(u32::MAX);
    let total = u32::try_from(total).unwrap_or(u32::MAX);
    (f64::from(done) / f64::from(total) * 100.0).clamp(0.0, 100.0)
}

/// Keep artifact names to a safe character set.
fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_total_safe() {
        assert_eq!(percent_of(0, 0), 100.0);
        assert_eq!(percent_of(1, 4), 25.0);
        assert_eq!(percent_of(4, 4), 100.0);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("report.txt"), "report.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name(""), "artifact");
    }
}
