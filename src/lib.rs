//! Straylight — a conversational assistant gateway.
//!
//! Chat channels (direct HTTP and a WhatsApp-style webhook) feed a facade
//! that turns each inbound message into an in-line reply or a durable
//! asynchronous job. Jobs, notifications, reminders, approvals, and
//! multi-step run plans all live as JSON records under a single state
//! directory; a worker pool drains the job queue with progress reporting
//! and watchdog recovery, and a dispatcher pushes outbound notifications
//! back to the chat channel.
//!
//! The crate is organized around component ownership: every on-disk record
//! has exactly one writer module, and cross-component flow happens through
//! the [`gateway`] facade and the [`runtime`] wiring.

pub mod adapters;
pub mod approvals;
pub mod builtins;
pub mod config;
pub mod dedupe;
pub mod events;
pub mod gateway;
pub mod http;
pub mod jobs;
pub mod logging;
pub mod outbound;
pub mod processors;
pub mod reminders;
pub mod runspec;
pub mod runtime;
pub mod services;
pub mod state;
