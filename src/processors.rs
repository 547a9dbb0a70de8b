//! Processor routing and the built-in stub processor.
//!
//! The worker pool takes a single [`Processor`]; [`JobRouter`] fans that
//! out by job type so `stub_task` and `run_spec` jobs coexist. Unknown
//! types fail non-retryably — a job that nothing can execute should
//! surface immediately rather than spin.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::jobs::{Job, ProcessContext, Processor};

/// Dispatches jobs to a processor registered for their type.
#[derive(Default)]
pub struct JobRouter {
    handlers: HashMap<String, Arc<dyn Processor>>,
}

impl JobRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for jobs of `job_type`, replacing any
    /// previous registration.
    pub fn register(mut self, job_type: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        self.handlers.insert(job_type.into(), processor);
        self
    }
}

#[async_trait]
impl Processor for JobRouter {
    async fn process(&self, job: &Job, ctx: &ProcessContext) -> anyhow::Result<Value> {
        match self.handlers.get(&job.job_type) {
            Some(processor) => processor.process(job, ctx).await,
            None => anyhow::bail!("no processor registered for job type {}", job.job_type),
        }
    }
}

/// Development processor for `stub_task` jobs.
///
/// Echoes the payload text back as `processed:<text>`, which gives the
/// end-to-end flow a deterministic observable result. A payload may carry
/// `simulateError` to exercise the failure and retry paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubTaskProcessor;

#[async_trait]
impl Processor for StubTaskProcessor {
    async fn process(&self, job: &Job, _ctx: &ProcessContext) -> anyhow::Result<Value> {
        if let Some(message) = job.payload.get("simulateError").and_then(Value::as_str) {
            anyhow::bail!("{message}");
        }

        let text = job
            .payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        debug!(job_id = %job.id, "stub task processed");
        Ok(json!({
            "summary": format!("processed:{text}"),
            "responseText": format!("Done: {text}"),
        }))
    }
}
