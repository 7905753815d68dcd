use std::fmt;

/// Errors returned to the event producer when dispatching fails *before*
/// any delivery is created.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    /// The event payload could not be serialized. No retry can fix this.
    #[error("event payload is not serializable: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The webhook registry could not be queried.
    #[error("webhook registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors surfaced by a [`WebhookRegistry`](crate::WebhookRegistry) backend.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RegistryError(pub String);

/// Errors surfaced by a [`DeliveryStore`](crate::DeliveryStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery not found: {0}")]
    NotFound(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Invalid engine configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Errors raised while starting the engine.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Reasons why an HTTP delivery attempt failed.
///
/// All variants feed the same retry policy unless fail-fast on client errors
/// is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The request exceeded the webhook's timeout.
    Timeout,
    /// Connection refused, DNS or TLS failure.
    Connect(String),
    /// Any other transport error while sending or reading the response.
    Network(String),
    /// The endpoint answered with a non-2xx status.
    HttpStatus(u16),
    /// The request could not be built (malformed URL, bad method).
    InvalidRequest(String),
}

impl FailureReason {
    /// Client errors other than 408 and 429 cannot be fixed by retrying.
    pub fn is_client_error(&self) -> bool {
        matches!(self, FailureReason::HttpStatus(code)
            if (400..500).contains(code) && *code != 408 && *code != 429)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Connect(msg) =>
                write!(f, "connection failed: {msg}"),
            FailureReason::Network(msg) =>
                write!(f, "network error: {msg}"),
            FailureReason::HttpStatus(code) =>
                write!(f, "HTTP {code}"),
            FailureReason::InvalidRequest(msg) =>
                write!(f, "invalid request: {msg}"),
        }
    }
}

/// Classified result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Failed(FailureReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_excludes_retryable_codes() {
        assert!(FailureReason::HttpStatus(400).is_client_error());
        assert!(FailureReason::HttpStatus(404).is_client_error());
        assert!(!FailureReason::HttpStatus(408).is_client_error());
        assert!(!FailureReason::HttpStatus(429).is_client_error());
        assert!(!FailureReason::HttpStatus(503).is_client_error());
        assert!(!FailureReason::Timeout.is_client_error());
    }

    #[test]
    fn failure_reason_display() {
        assert_eq!(FailureReason::HttpStatus(503).to_string(), "HTTP 503");
        assert_eq!(FailureReason::Timeout.to_string(), "request timed out");
    }
}
