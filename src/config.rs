//! Engine configuration.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// Upper bound for `max_retry_delay_ms` (seven days).
const MAX_RETRY_DELAY_CEILING_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Tuning knobs shared by the dispatcher, workers and retry scheduler.
///
/// Per-webhook delivery policy (timeout, retry budget, base delay) lives on
/// [`Webhook`](crate::Webhook); everything here is engine-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker tasks pulling attempts from the ready queue.
    pub worker_count: usize,

    /// Global cap on simultaneous outbound HTTP calls.
    pub max_in_flight: usize,

    /// Capacity of the ready queue. `dispatch` waits when it is full.
    pub queue_size: usize,

    /// Ceiling applied to the exponential backoff delay.
    pub max_retry_delay_ms: u64,

    /// Uniform random jitter added to each backoff delay. Zero disables it.
    pub retry_jitter_ms: u64,

    /// Finalize 4xx responses (except 408/429) as `FAILED` without retrying.
    pub fail_fast_on_client_error: bool,

    pub signature_header: String,
    pub user_agent: String,
    pub max_response_body_len: usize,
    pub max_error_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            max_in_flight: 100,
            queue_size: 1_000,
            max_retry_delay_ms: 3_600_000,
            retry_jitter_ms: 0,
            fail_fast_on_client_error: false,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            user_agent: concat!("webhook-engine/", env!("CARGO_PKG_VERSION")).to_string(),
            max_response_body_len: 4_096,
            max_error_len: 1_000,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// Recognized (all optional):
    /// - `WEBHOOK_WORKER_COUNT`, `WEBHOOK_MAX_IN_FLIGHT`, `WEBHOOK_QUEUE_SIZE`
    /// - `WEBHOOK_MAX_RETRY_DELAY_MS`, `WEBHOOK_RETRY_JITTER_MS`
    /// - `WEBHOOK_FAIL_FAST_CLIENT_ERRORS` (`true`/`false`)
    /// - `WEBHOOK_SIGNATURE_HEADER`, `WEBHOOK_USER_AGENT`
    /// - `WEBHOOK_MAX_RESPONSE_BODY_LEN`, `WEBHOOK_MAX_ERROR_LEN`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "WEBHOOK_WORKER_COUNT")? {
            config.worker_count = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_MAX_IN_FLIGHT")? {
            config.max_in_flight = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_QUEUE_SIZE")? {
            config.queue_size = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_MAX_RETRY_DELAY_MS")? {
            config.max_retry_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_RETRY_JITTER_MS")? {
            config.retry_jitter_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_FAIL_FAST_CLIENT_ERRORS")? {
            config.fail_fast_on_client_error = v;
        }
        if let Some(v) = lookup("WEBHOOK_SIGNATURE_HEADER") {
            config.signature_header = v;
        }
        if let Some(v) = lookup("WEBHOOK_USER_AGENT") {
            config.user_agent = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_MAX_RESPONSE_BODY_LEN")? {
            config.max_response_body_len = v;
        }
        if let Some(v) = parse_var(&lookup, "WEBHOOK_MAX_ERROR_LEN")? {
            config.max_error_len = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(invalid("WEBHOOK_WORKER_COUNT", "must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(invalid("WEBHOOK_MAX_IN_FLIGHT", "must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(invalid("WEBHOOK_QUEUE_SIZE", "must be at least 1"));
        }
        if self.max_retry_delay_ms == 0 || self.max_retry_delay_ms > MAX_RETRY_DELAY_CEILING_MS {
            return Err(invalid(
                "WEBHOOK_MAX_RETRY_DELAY_MS",
                &format!("must be between 1 and {MAX_RETRY_DELAY_CEILING_MS}"),
            ));
        }
        if self.retry_jitter_ms > self.max_retry_delay_ms {
            return Err(invalid(
                "WEBHOOK_RETRY_JITTER_MS",
                "must not exceed the maximum retry delay",
            ));
        }
        if self.signature_header.trim().is_empty() {
            return Err(invalid("WEBHOOK_SIGNATURE_HEADER", "must not be empty"));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(var, &format!("{raw:?}: {e}"))),
    }
}

fn invalid(var: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}
