//! Gateway facade: turns inbound chat messages into actions.
//!
//! Every inbound message resolves to exactly one of:
//! - an approval resolution (`approve <token>`, bare `yes` / `no`),
//! - a run-spec step approval (`approve step <stepId> of run <runId>`),
//! - a durable job (`requestJob`), or
//! - an in-line chat reply (LLM-backed when configured, deterministic
//!   `ack:<text>` otherwise).
//!
//! The WhatsApp-style webhook goes through the same pipeline after a
//! dedupe check on the channel message id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::approvals::{ApprovalError, ApprovalStore, ApprovalToken};
use crate::dedupe::{DedupeError, DedupeStore};
use crate::events::{ConversationLog, NewConversationEvent};
use crate::jobs::{CreateJob, JobStore, JobStoreError};
use crate::outbound::{NewNotification, NotificationError, NotificationStore};
use crate::runspec::{RunSpecStore, RunSpecStoreError};
use crate::services::{ApprovalAction, LlmService};

/// Default priority for jobs created from chat messages.
const CHAT_JOB_PRIORITY: i64 = 5;

/// Job type used for chat-requested work.
const CHAT_JOB_TYPE: &str = "stub_task";

/// An inbound chat message, channel-agnostic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Session the message belongs to.
    pub session_id: String,
    /// Message text.
    pub text: String,
    /// Whether the sender asked for a durable job.
    pub request_job: bool,
    /// Free-form metadata merged into a created job's payload.
    pub metadata: Value,
    /// Channel label recorded on conversation events.
    pub channel: String,
}

impl InboundMessage {
    /// Message over the direct HTTP channel.
    pub fn http(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            request_job: false,
            metadata: Value::Null,
            channel: "http".to_owned(),
        }
    }
}

/// What the gateway decided to do with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    /// In-line chat reply.
    Chat {
        /// Reply text.
        response: String,
    },
    /// A durable job was created.
    AsyncJob {
        /// Id of the created job.
        job_id: String,
    },
    /// An approval was resolved (or found missing).
    Approval {
        /// `approve` or `reject`.
        decision: String,
        /// Whether a pending approval was actually matched.
        resolved: bool,
        /// Action of the matched approval.
        action: Option<String>,
        /// Token of the matched approval.
        token: Option<String>,
        /// Operator-facing detail line.
        detail: String,
    },
    /// A run-spec step approval was granted.
    StepApproval {
        /// Run id.
        run_id: String,
        /// Approved step id.
        step_id: String,
    },
}

/// Outcome of a webhook delivery: either a duplicate, or a response.
#[derive(Debug, Clone, PartialEq)]
pub struct BaileysOutcome {
    /// Whether the delivery was a dedupe hit.
    pub duplicate: bool,
    /// The pipeline response (absent for duplicates).
    pub response: Option<GatewayResponse>,
}

/// Errors raised by the facade.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed direct inbound message.
    #[error("invalid_inbound_message: {0}")]
    InvalidInbound(String),
    /// Malformed webhook payload.
    #[error("invalid_baileys_inbound: {0}")]
    InvalidBaileys(String),
    /// Job store failure.
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    /// Approval store failure.
    #[error(transparent)]
    Approvals(#[from] ApprovalError),
    /// Run-spec store failure.
    #[error(transparent)]
    Runs(#[from] RunSpecStoreError),
    /// Notification store failure.
    #[error(transparent)]
    Notifications(#[from] NotificationError),
    /// Dedupe store failure.
    #[error(transparent)]
    Dedupe(#[from] DedupeError),
}

/// The facade over jobs, approvals, runs, notifications, and the log.
pub struct Gateway {
    jobs: Arc<JobStore>,
    approvals: Arc<ApprovalStore>,
    runs: Arc<RunSpecStore>,
    notifications: Arc<NotificationStore>,
    conversation: Arc<ConversationLog>,
    dedupe: Arc<DedupeStore>,
    llm: Option<Arc<dyn LlmService>>,
    public_base_url: Option<String>,
    actions: Mutex<HashMap<String, Arc<dyn ApprovalAction>>>,
    step_approval: Regex,
}

impl Gateway {
    /// Wire the facade over its stores. No LLM by default.
    pub fn new(
        jobs: Arc<JobStore>,
        approvals: Arc<ApprovalStore>,
        runs: Arc<RunSpecStore>,
        notifications: Arc<NotificationStore>,
        conversation: Arc<ConversationLog>,
        dedupe: Arc<DedupeStore>,
    ) -> Self {
        Self {
            jobs,
            approvals,
            runs,
            notifications,
            conversation,
            dedupe,
            llm: None,
            public_base_url: None,
            actions: Mutex::new(HashMap::new()),
            // Anchored, case-insensitive: the whole message is the command.
            step_approval: Regex::new(r"(?i)^approve\s+step\s+(\S+)\s+of\s+run\s+(\S+)$")
                .expect("static regex"),
        }
    }

    /// Attach a text-generation collaborator for chat replies.
    pub fn with_llm(mut self, llm: Arc<dyn LlmService>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Advertise job-tracking links under this base URL in notifications.
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into());
        self
    }

    /// Register the handler executed when an approval for `action` is
    /// granted.
    pub fn register_action(&self, action: impl Into<String>, handler: Arc<dyn ApprovalAction>) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.insert(action.into(), handler);
        }
    }

    /// Run one inbound message through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidInbound`] for empty session or text;
    /// store failures propagate.
    pub async fn handle_inbound(
        &self,
        message: InboundMessage,
    ) -> Result<GatewayResponse, GatewayError> {
        let session_id = message.session_id.trim().to_owned();
        let text = message.text.trim().to_owned();
        if session_id.is_empty() {
            return Err(GatewayError::InvalidInbound("sessionId is required".to_owned()));
        }
        if text.is_empty() {
            return Err(GatewayError::InvalidInbound("text is required".to_owned()));
        }

        self.record_event(&session_id, &message.channel, "inbound", "message", &text);

        if let Some((run_id, step_id)) = self.parse_step_approval(&text) {
            return self
                .grant_step(&session_id, &message.channel, &run_id, &step_id)
                .await;
        }

        if let Some((accept, token)) = parse_approval_verb(&text) {
            return self
                .resolve_approval(&session_id, &message.channel, accept, token)
                .await;
        }

        if message.request_job {
            return self.create_chat_job(&session_id, &message.channel, &text, &message.metadata);
        }

        let response = self.chat_reply(&session_id, &text).await;
        self.record_event(&session_id, &message.channel, "outbound", "message", &response);
        Ok(GatewayResponse::Chat { response })
    }

    /// Run a Baileys-style webhook body through dedupe and the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidBaileys`] when the body is missing
    /// the message key or text.
    pub async fn handle_baileys(&self, body: &Value) -> Result<BaileysOutcome, GatewayError> {
        let message_id = body
            .pointer("/key/id")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GatewayError::InvalidBaileys("key.id is required".to_owned()))?;
        let remote_jid = body
            .pointer("/key/remoteJid")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GatewayError::InvalidBaileys("key.remoteJid is required".to_owned()))?;
        let conversation = body
            .pointer("/message/conversation")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidBaileys("message.conversation is required".to_owned())
            })?;

        let fingerprint = DedupeStore::baileys_key(remote_jid, message_id);
        if self.dedupe.is_duplicate_and_mark(&fingerprint)? {
            debug!(fingerprint, "dropping duplicate webhook delivery");
            return Ok(BaileysOutcome {
                duplicate: true,
                response: None,
            });
        }

        // `/job <text>` asks for a durable job; anything else is chat.
        let (request_job, text) = match conversation.strip_prefix("/job") {
            Some(rest) => {
                let rest = rest.trim();
                let text = if rest.is_empty() { conversation } else { rest };
                (true, text.to_owned())
            }
            None => (false, conversation.to_owned()),
        };

        let response = self
            .handle_inbound(InboundMessage {
                session_id: remote_jid.to_owned(),
                text,
                request_job,
                metadata: json!({ "messageId": message_id }),
                channel: "baileys".to_owned(),
            })
            .await?;

        Ok(BaileysOutcome {
            duplicate: false,
            response: Some(response),
        })
    }

    fn parse_step_approval(&self, text: &str) -> Option<(String, String)> {
        self.step_approval.captures(text).map(|captures| {
            (
                captures
                    .get(2)
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_default(),
                captures
                    .get(1)
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_default(),
            )
        })
    }

    async fn grant_step(
        &self,
        session_id: &str,
        channel: &str,
        run_id: &str,
        step_id: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        match self.runs.grant_step_approval(run_id, step_id) {
            Ok(_) => {
                let ack = format!("Approved step {step_id} of run {run_id}.");
                self.record_event(session_id, channel, "outbound", "approval", &ack);
                info!(session_id, run_id, step_id, "step approval granted via chat");
                Ok(GatewayResponse::StepApproval {
                    run_id: run_id.to_owned(),
                    step_id: step_id.to_owned(),
                })
            }
            // Unknown run/step stays conversational: the channel contract
            // for inbound messages is a reply, not an HTTP error.
            Err(RunSpecStoreError::NotFound(_)) => Ok(GatewayResponse::Chat {
                response: format!("I don't know a run {run_id}."),
            }),
            Err(RunSpecStoreError::StepNotFound { .. }) => Ok(GatewayResponse::Chat {
                response: format!("Run {run_id} has no step {step_id}."),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_approval(
        &self,
        session_id: &str,
        channel: &str,
        accept: bool,
        token: Option<String>,
    ) -> Result<GatewayResponse, GatewayError> {
        let matched: Option<ApprovalToken> = match (&token, accept) {
            (Some(token), _) => self.approvals.consume(session_id, token)?,
            (None, true) => self.approvals.consume_latest(session_id)?,
            (None, false) => self.approvals.discard_latest(session_id)?,
        };

        let decision = if accept { "approve" } else { "reject" };
        let Some(approval) = matched else {
            let detail = "No matching pending approval.".to_owned();
            self.record_event(session_id, channel, "outbound", "approval", &detail);
            return Ok(GatewayResponse::Approval {
                decision: decision.to_owned(),
                resolved: false,
                action: None,
                token,
                detail,
            });
        };

        let detail = if accept {
            match self.run_action(session_id, &approval).await {
                Ok(Some(result)) => result,
                Ok(None) => format!("Approved {}.", approval.action),
                Err(e) => {
                    warn!(
                        session_id,
                        action = %approval.action,
                        error = %e,
                        "approved action handler failed"
                    );
                    format!("Approved {}, but the action failed: {e}", approval.action)
                }
            }
        } else {
            format!("Rejected {}.", approval.action)
        };

        self.record_event(session_id, channel, "outbound", "approval", &detail);
        info!(session_id, action = %approval.action, decision, "approval resolved");
        Ok(GatewayResponse::Approval {
            decision: decision.to_owned(),
            resolved: true,
            action: Some(approval.action),
            token: Some(approval.token),
            detail,
        })
    }

    async fn run_action(
        &self,
        session_id: &str,
        approval: &ApprovalToken,
    ) -> anyhow::Result<Option<String>> {
        let handler = self
            .actions
            .lock()
            .ok()
            .and_then(|actions| actions.get(&approval.action).cloned());
        match handler {
            Some(handler) => handler
                .run(session_id, &approval.payload)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    fn create_chat_job(
        &self,
        session_id: &str,
        channel: &str,
        text: &str,
        metadata: &Value,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut payload = json!({
            "text": text,
            "sessionId": session_id,
        });
        if let (Some(payload_map), Some(metadata_map)) =
            (payload.as_object_mut(), metadata.as_object())
        {
            for (key, value) in metadata_map {
                payload_map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let job = self.jobs.create_job(CreateJob {
            job_type: CHAT_JOB_TYPE.to_owned(),
            payload,
            priority: CHAT_JOB_PRIORITY,
            requested_skill: None,
        })?;

        let mut body = format!("Queued job {} for: {text}", job.id);
        if let Some(base_url) = &self.public_base_url {
            let base_url = base_url.trim_end_matches('/');
            body.push_str(&format!("\n{base_url}/v1/jobs/{}", job.id));
        }
        let mut notification = NewNotification::text(session_id, body);
        notification.job_id = Some(job.id.clone());
        notification.status = Some("queued".to_owned());
        self.notifications.enqueue(notification)?;

        self.record_event(
            session_id,
            channel,
            "outbound",
            "job_status",
            &format!("queued job {}", job.id),
        );
        Ok(GatewayResponse::AsyncJob { job_id: job.id })
    }

    async fn chat_reply(&self, session_id: &str, text: &str) -> String {
        if let Some(llm) = &self.llm {
            match llm.generate_text(session_id, text).await {
                Ok(Some(reply)) if !reply.trim().is_empty() => return reply,
                Ok(_) => debug!(session_id, "llm declined, using fallback reply"),
                Err(e) => warn!(session_id, error = %e, "llm failed, using fallback reply"),
            }
        }
        format!("ack:{text}")
    }

    fn record_event(&self, session_id: &str, channel: &str, direction: &str, kind: &str, text: &str) {
        self.conversation.add(NewConversationEvent {
            session_id: session_id.to_owned(),
            source: "gateway".to_owned(),
            channel: channel.to_owned(),
            direction: direction.to_owned(),
            kind: kind.to_owned(),
            text: text.to_owned(),
            metadata: Value::Null,
        });
    }
}

/// Parse a bare approval verb: `approve` / `yes` (accept) or `reject` /
/// `no` (reject), optionally followed by a single token. Longer messages
/// are not approval verbs.
fn parse_approval_verb(text: &str) -> Option<(bool, Option<String>)> {
    let mut words = text.split_whitespace();
    let verb = words.next()?.to_lowercase();
    let token = words.next().map(str::to_owned);
    if words.next().is_some() {
        return None;
    }
    match verb.as_str() {
        "approve" | "yes" => Some((true, token)),
        "reject" | "no" => Some((false, token)),
        _ => None,
    }
}
