use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Unique identifier for a webhook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of webhook IDs with other identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub Uuid);

/// Unique identifier for a delivery (one event × webhook pairing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(WebhookId);
uuid_id!(DeliveryId);
uuid_id!(EventId);

/// HTTP method used for outbound delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
    Get,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Get => "GET",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A configured external endpoint subscribed to one or more event types.
///
/// Webhooks are owned by the configuration store; the engine only reads
/// them. A delivery keeps the snapshot it was created with, so later
/// configuration changes do not affect attempts already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub name: String,

    /// Target URL for webhook delivery.
    pub url: String,

    pub enabled: bool,

    /// Soft-delete flag. Deleted webhooks are never matched.
    pub deleted: bool,

    /// Event types this webhook fires for.
    pub event_types: BTreeSet<String>,

    pub method: HttpMethod,
    pub content_type: String,

    /// Maximum time allowed for a single delivery attempt.
    pub timeout_ms: u64,

    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff.
    pub retry_delay_ms: u64,

    /// Optional secret for HMAC signing. Empty means unsigned.
    pub secret: Option<String>,

    /// Opaque headers added to every request.
    pub headers: BTreeMap<String, String>,
}

impl Webhook {
    /// Create an enabled webhook with default delivery settings.
    ///
    /// Defaults:
    /// - method: POST, content type: `application/json`
    /// - timeout: 30 seconds
    /// - max_retries: 3, retry delay: 1 second
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: WebhookId::new(),
            name: name.into(),
            url: url.into(),
            enabled: true,
            deleted: false,
            event_types: BTreeSet::new(),
            method: HttpMethod::default(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            secret: None,
            headers: BTreeMap::new(),
        }
    }

    /// Subscribe to an event type.
    pub fn subscribe(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.insert(event_type.into());
        self
    }

    /// Subscribe to several event types at once.
    pub fn with_events<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types.extend(event_types.into_iter().map(Into::into));
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set a custom timeout for delivery attempts.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum number of retry attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay of the exponential backoff.
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Set a secret for HMAC signing.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Add a custom header sent with every delivery.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// A webhook is active iff enabled and not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }

    pub fn should_trigger_for(&self, event_type: &str) -> bool {
        self.is_active() && self.event_types.contains(event_type)
    }

    /// The signing secret, if one is configured and non-empty.
    pub fn signing_secret(&self) -> Option<&[u8]> {
        self.secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Typed fact emitted by the surrounding application.
///
/// The payload is serialized once per dispatch; the resulting JSON is the
/// request body for every matching webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<P = serde_json::Value> {
    pub id: EventId,
    pub event_type: String,
    pub payload: P,
    pub occurred_at: DateTime<Utc>,
}

impl<P> Event<P> {
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Retrying => "RETRYING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }
}

/// One logical delivery of an event to a webhook, across all its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event_id: EventId,
    pub event_type: String,

    /// Serialized request body, identical for every attempt.
    pub request_payload: String,

    /// Headers sent with the latest attempt.
    pub request_headers: BTreeMap<String, String>,

    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub duration_ms: Option<u64>,

    /// Number of retries already scheduled.
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// A fresh `PENDING` delivery for `webhook`.
    pub fn pending(
        webhook: &Webhook,
        event_id: EventId,
        event_type: impl Into<String>,
        request_payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::new(),
            webhook_id: webhook.id,
            event_id,
            event_type: event_type.into(),
            request_payload: request_payload.into(),
            request_headers: BTreeMap::new(),
            status: DeliveryStatus::Pending,
            status_code: None,
            response_body: None,
            duration_ms: None,
            retry_count: 0,
            next_retry_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Copy the observable outcome of an attempt onto the delivery.
    pub fn apply_attempt(&mut self, attempt: &DeliveryAttempt) {
        if self.status.is_terminal() {
            return;
        }
        self.request_headers = attempt.request_headers.clone();
        self.status_code = attempt.status_code;
        self.response_body = attempt.response_body.clone();
        self.duration_ms = Some(attempt.duration_ms);
        self.error_message = attempt.error_message.clone();
        self.updated_at = Utc::now();
    }

    /// Transition to `SUCCESS`. Returns `false` if already terminal.
    pub fn mark_success(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = DeliveryStatus::Success;
        self.next_retry_at = None;
        self.error_message = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Transition to `RETRYING` with the next attempt `delay` from `now`.
    pub fn mark_retrying(&mut self, delay: Duration, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let delay = chrono::Duration::milliseconds(
            i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
        );
        self.status = DeliveryStatus::Retrying;
        self.retry_count += 1;
        self.next_retry_at = Some(now.checked_add_signed(delay).unwrap_or(now));
        self.updated_at = now;
        true
    }

    /// Transition to `FAILED`. Returns `false` if already terminal.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = DeliveryStatus::Failed;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }
}

/// Immutable snapshot of one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub delivery_id: DeliveryId,

    /// Zero-based; equals the delivery's retry count when the attempt ran.
    pub attempt_index: u32,
    pub started_at: DateTime<Utc>,
    pub request_headers: BTreeMap<String, String>,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub succeeded: bool,
}

/// Rolling health counters of a webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WebhookHealth {
    pub fn apply_success(&mut self, at: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success_at = Some(at);
        self.last_error = None;
    }

    pub fn apply_failure(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.failure_count += 1;
        self.last_failure_at = Some(at);
        self.last_error = Some(error.into());
    }
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
