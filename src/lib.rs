//! An event-driven webhook delivery engine.
//!
//! The surrounding application emits typed [`Event`]s. The [`Dispatcher`]
//! fans each one out to every active [`Webhook`] subscribed to its type and
//! delivers it asynchronously over HTTP:
//!
//! - one persisted [`WebhookDelivery`] per matching webhook
//! - optional HMAC-SHA256 signature over the exact request body
//! - bounded exponential backoff (`base * 2^k`, capped)
//! - terminal `SUCCESS` / `FAILED` states that never change again
//! - per-webhook success and failure counters
//!
//! ## Guarantees
//! - `dispatch` never blocks on delivery outcomes
//! - A retry is armed only after its `RETRYING` state is persisted
//! - Attempts of one delivery never overlap
//! - At-least-once delivery across restarts via
//!   [`Dispatcher::resume_unfinished`]
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between deliveries
//! - Distributed coordination

mod config;
mod dispatcher;
mod error;
mod executor;
mod health;
mod registry;
mod retry;
mod signing;
mod storage;
mod telemetry;
mod types;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::{EngineConfig, DEFAULT_SIGNATURE_HEADER, DELIVERY_HEADER, EVENT_HEADER};
pub use dispatcher::Dispatcher;
pub use error::{
    AttemptOutcome,
    ConfigError,
    DispatchError,
    FailureReason,
    RegistryError,
    StartError,
    StoreError,
};
pub use executor::{DeliveryExecutor, ExecutionResult};
pub use registry::{InMemoryWebhookRegistry, WebhookRegistry};
pub use retry::{backoff_delay, RetryDecision, RetryPolicy};
pub use signing::{
    compute_signature,
    parse_signature_header,
    signature_header,
    verify_signature,
    verify_webhook_request,
    VerificationError,
};
pub use storage::{DeliveryStore, InMemoryDeliveryStore};
pub use types::{
    truncate,
    DeliveryAttempt,
    DeliveryId,
    DeliveryStatus,
    Event,
    EventId,
    HttpMethod,
    Webhook,
    WebhookDelivery,
    WebhookHealth,
    WebhookId,
    DEFAULT_CONTENT_TYPE,
    DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY_MS,
    DEFAULT_TIMEOUT_MS,
};

#[cfg(feature = "redis")]
pub use storage_redis::RedisDeliveryStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresDeliveryStore;
