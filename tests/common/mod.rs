//! Shared fixtures for the delivery engine integration tests.
//!
//! Provides wiremock responders, a failure-injecting store wrapper and
//! polling helpers. Retry delays in tests are kept in the tens of
//! milliseconds so full retry sequences finish quickly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use wiremock::{Request, Respond, ResponseTemplate};

use webhook_engine::{
    DeliveryAttempt, DeliveryId, DeliveryStatus, DeliveryStore, Dispatcher, EngineConfig,
    InMemoryDeliveryStore, InMemoryWebhookRegistry, StoreError, WebhookDelivery, WebhookHealth,
    WebhookId,
};

pub const SECRET: &str = "whsec_test_secret_key_12345";
pub const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Engine setup
// ---------------------------------------------------------------------------

/// Small pool sizes so tests exercise queueing.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        worker_count: 4,
        max_in_flight: 8,
        queue_size: 64,
        ..Default::default()
    }
}

pub struct TestEngine {
    pub dispatcher: Dispatcher,
    pub registry: Arc<InMemoryWebhookRegistry>,
    pub store: Arc<InMemoryDeliveryStore>,
}

pub fn start_engine(config: EngineConfig) -> TestEngine {
    start_engine_with_store(config, Arc::new(InMemoryDeliveryStore::new()))
}

pub fn start_engine_with_store(config: EngineConfig, store: Arc<InMemoryDeliveryStore>) -> TestEngine {
    let registry = Arc::new(InMemoryWebhookRegistry::new());
    let dispatcher = Dispatcher::new(config, registry.clone(), store.clone())
        .expect("dispatcher should start");
    TestEngine {
        dispatcher,
        registry,
        store,
    }
}

/// Poll the store until the delivery reaches `SUCCESS` or `FAILED`.
pub async fn wait_for_terminal(store: &dyn DeliveryStore, id: DeliveryId) -> WebhookDelivery {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(delivery) = store.get_delivery(id).await.expect("store read") {
            if delivery.status.is_terminal() {
                return delivery;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery {id} did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the delivery has the given status.
pub async fn wait_for_status(store: &dyn DeliveryStore, id: DeliveryId, status: DeliveryStatus) -> WebhookDelivery {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(delivery) = store.get_delivery(id).await.expect("store read") {
            if delivery.status == status {
                return delivery;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery {id} never reached {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - records requests, answers with a fixed status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub received_at: Instant,
    pub method: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
    delay: Option<Duration>,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
            delay: None,
        }
    }

    /// Hold every response back for `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            received_at: Instant::now(),
            method: request.method.to_string(),
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        self.requests.lock().unwrap().push(captured);
        let template = ResponseTemplate::new(self.response_code);
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedResponder - plays a list of statuses, then repeats the last one
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScriptedResponder {
    statuses: Arc<Vec<u16>>,
    calls: Arc<AtomicU32>,
}

impl ScriptedResponder {
    pub fn new(statuses: &[u16]) -> Self {
        assert!(!statuses.is_empty());
        Self {
            statuses: Arc::new(statuses.to_vec()),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always(status: u16) -> Self {
        Self::new(&[status])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Respond for ScriptedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let status = self.statuses[n.min(self.statuses.len() - 1)];
        ResponseTemplate::new(status)
    }
}

// ---------------------------------------------------------------------------
// FlakyStore - in-memory store with switchable write failures
// ---------------------------------------------------------------------------

/// Wraps [`InMemoryDeliveryStore`] and fails selected writes on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryDeliveryStore,
    pub fail_inserts: AtomicBool,
    pub fail_retry_updates: AtomicBool,
    pub fail_terminal_updates: AtomicBool,
}

#[async_trait]
impl DeliveryStore for FlakyStore {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("insert rejected".into()));
        }
        self.inner.insert_delivery(delivery).await
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        if delivery.status == DeliveryStatus::Retrying && self.fail_retry_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("update rejected".into()));
        }
        if delivery.status.is_terminal() && self.fail_terminal_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("update rejected".into()));
        }
        self.inner.update_delivery(delivery).await
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        self.inner.record_attempt(attempt).await
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        self.inner.get_delivery(id).await
    }

    async fn deliveries_for_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.inner.deliveries_for_webhook(webhook_id).await
    }

    async fn attempts_for(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        self.inner.attempts_for(delivery_id).await
    }

    async fn unfinished_deliveries(&self) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.inner.unfinished_deliveries().await
    }

    async fn increment_success(&self, webhook_id: WebhookId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.increment_success(webhook_id, at).await
    }

    async fn increment_failure(&self, webhook_id: WebhookId, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        self.inner.increment_failure(webhook_id, at, error).await
    }

    async fn webhook_health(&self, webhook_id: WebhookId) -> Result<WebhookHealth, StoreError> {
        self.inner.webhook_health(webhook_id).await
    }
}
