//! Environment-driven configuration.
//!
//! Every knob is an environment variable with a documented default; a
//! `.env` file is honored when present (loaded by the binary before
//! [`Config::from_env`] runs). Numeric knobs are clamped to safe ranges
//! rather than rejected, so a misconfigured deployment degrades to sane
//! behavior instead of refusing to boot. Parse *errors* (non-numeric
//! values) are still fatal.

use std::path::PathBuf;

use serde::Serialize;

/// Lower bound for polling intervals in milliseconds.
const MIN_POLL_MS: u64 = 25;
/// Upper bound for polling intervals in milliseconds.
const MAX_POLL_MS: u64 = 60_000;
/// Floor for the running-job watchdog timeout.
const MIN_RUNNING_TIMEOUT_MS: u64 = 30_000;
/// Floor for the cancelling-job watchdog timeout.
const MIN_CANCELLING_TIMEOUT_MS: u64 = 10_000;
/// Ceiling for both watchdog timeouts (24 hours).
const MAX_WATCHDOG_TIMEOUT_MS: u64 = 86_400_000;

/// Runtime configuration resolved from the environment.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// HTTP listen port (`PORT`, default 3000).
    pub port: u16,
    /// State directory root (`STATE_DIR`, default `./state`).
    pub state_dir: PathBuf,
    /// Number of worker tasks (`WORKER_COUNT`, default 1, clamped [1, 16]).
    pub worker_count: usize,
    /// Worker poll interval (`WORKER_POLL_MS`, default 250, clamped [25, 60000]).
    pub worker_poll_ms: u64,
    /// Notification dispatcher poll interval (`NOTIFICATION_POLL_MS`, default 500).
    pub notification_poll_ms: u64,
    /// Reminder dispatcher poll interval (`REMINDER_POLL_MS`, default 1000).
    pub reminder_poll_ms: u64,
    /// Watchdog timeout for `running` jobs (`JOB_RUNNING_TIMEOUT_MS`, default 10 min).
    pub running_timeout_ms: u64,
    /// Watchdog timeout for `cancelling` jobs (`JOB_CANCELLING_TIMEOUT_MS`, default 90 s).
    pub cancelling_timeout_ms: u64,
    /// Maximum events retained for the live stream (`STREAM_MAX_EVENTS`, default 5000).
    pub stream_max_events: usize,
    /// Stream retention in days (`STREAM_RETENTION_DAYS`, default 14).
    pub stream_retention_days: u32,
    /// Stream dedupe window (`STREAM_DEDUPE_WINDOW_MS`, default 2500).
    pub stream_dedupe_window_ms: u64,
    /// Inbound webhook dedupe window (`DEDUPE_WINDOW_MS`, default 24 h).
    pub dedupe_window_ms: u64,
    /// Approval token TTL (`APPROVAL_TTL_MS`, default 10 min).
    pub approval_ttl_ms: u64,
    /// Public base URL advertised in outbound links (`PUBLIC_BASE_URL`).
    pub public_base_url: Option<String>,
    /// Shared secret required on the Baileys webhook
    /// (`WHATSAPP_BAILEYS_INBOUND_TOKEN`). Unset disables the check.
    pub baileys_inbound_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            state_dir: PathBuf::from("./state"),
            worker_count: 1,
            worker_poll_ms: 250,
            notification_poll_ms: 500,
            reminder_poll_ms: 1_000,
            running_timeout_ms: 600_000,
            cancelling_timeout_ms: 90_000,
            stream_max_events: 5_000,
            stream_retention_days: 14,
            stream_dedupe_window_ms: 2_500,
            dedupe_window_ms: 86_400_000,
            approval_ttl_ms: 600_000,
            public_base_url: None,
            baileys_inbound_token: None,
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a numeric variable is set but not parseable.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let port = env_parse("PORT", defaults.port)?;
        let state_dir = std::env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let worker_count = env_parse("WORKER_COUNT", defaults.worker_count)?.clamp(1, 16);
        let worker_poll_ms =
            env_parse("WORKER_POLL_MS", defaults.worker_poll_ms)?.clamp(MIN_POLL_MS, MAX_POLL_MS);
        let notification_poll_ms = env_parse("NOTIFICATION_POLL_MS", defaults.notification_poll_ms)?
            .clamp(MIN_POLL_MS, MAX_POLL_MS);
        let reminder_poll_ms =
            env_parse("REMINDER_POLL_MS", defaults.reminder_poll_ms)?.clamp(100, 300_000);

        let running_timeout_ms = env_parse("JOB_RUNNING_TIMEOUT_MS", defaults.running_timeout_ms)?
            .clamp(MIN_RUNNING_TIMEOUT_MS, MAX_WATCHDOG_TIMEOUT_MS);
        let cancelling_timeout_ms =
            env_parse("JOB_CANCELLING_TIMEOUT_MS", defaults.cancelling_timeout_ms)?
                .clamp(MIN_CANCELLING_TIMEOUT_MS, MAX_WATCHDOG_TIMEOUT_MS);

        let stream_max_events =
            env_parse("STREAM_MAX_EVENTS", defaults.stream_max_events)?.clamp(100, 100_000);
        let stream_retention_days =
            env_parse("STREAM_RETENTION_DAYS", defaults.stream_retention_days)?.clamp(1, 365);
        let stream_dedupe_window_ms =
            env_parse("STREAM_DEDUPE_WINDOW_MS", defaults.stream_dedupe_window_ms)?
                .clamp(0, 60_000);
        let dedupe_window_ms =
            env_parse("DEDUPE_WINDOW_MS", defaults.dedupe_window_ms)?.clamp(60_000, 604_800_000);
        let approval_ttl_ms =
            env_parse("APPROVAL_TTL_MS", defaults.approval_ttl_ms)?.clamp(10_000, 3_600_000);

        let public_base_url = env_nonempty("PUBLIC_BASE_URL");
        let baileys_inbound_token = env_nonempty("WHATSAPP_BAILEYS_INBOUND_TOKEN");

        Ok(Self {
            port,
            state_dir,
            worker_count,
            worker_poll_ms,
            notification_poll_ms,
            reminder_poll_ms,
            running_timeout_ms,
            cancelling_timeout_ms,
            stream_max_events,
            stream_retention_days,
            stream_dedupe_window_ms,
            dedupe_window_ms,
            approval_ttl_ms,
            public_base_url,
            baileys_inbound_token,
        })
    }
}

/// Parse an environment variable, falling back to `default` when unset.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        _ => Ok(default),
    }
}

/// Read an environment variable, treating empty values as unset.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
