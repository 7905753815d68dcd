use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{DeliveryAttempt, DeliveryId, DeliveryStatus, WebhookDelivery, WebhookHealth, WebhookId};

/// Narrow persistence interface for delivery records and webhook health.
///
/// Writes must be durable when the future resolves: the scheduler arms a
/// retry timer only after `update_delivery` has returned `Ok`.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError>;

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError>;
    async fn deliveries_for_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Attempts of a delivery, oldest first.
    async fn attempts_for(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Deliveries still `PENDING` or `RETRYING`, used to resume after restart.
    async fn unfinished_deliveries(&self) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Increment-in-place; never read-modify-write from the caller's side.
    async fn increment_success(&self, webhook_id: WebhookId, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn increment_failure(&self, webhook_id: WebhookId, at: DateTime<Utc>, error: &str) -> Result<(), StoreError>;
    async fn webhook_health(&self, webhook_id: WebhookId) -> Result<WebhookHealth, StoreError>;
}

/// In-memory storage for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    deliveries: Mutex<HashMap<DeliveryId, WebhookDelivery>>,
    attempts: Mutex<HashMap<DeliveryId, Vec<DeliveryAttempt>>>,
    health: Mutex<HashMap<WebhookId, WebhookHealth>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_deliveries(&self) -> Vec<WebhookDelivery> {
        let mut all: Vec<_> = self.deliveries.lock().await.values().cloned().collect();
        all.sort_by_key(|d| d.created_at);
        all
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.deliveries.lock().await.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut guard = self.deliveries.lock().await;
        match guard.get_mut(&delivery.id) {
            Some(existing) => {
                *existing = delivery.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(delivery.id.to_string())),
        }
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        self.attempts
            .lock()
            .await
            .entry(attempt.delivery_id)
            .or_default()
            .push(attempt.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        Ok(self.deliveries.lock().await.get(&id).cloned())
    }

    async fn deliveries_for_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut matched: Vec<_> = self
            .deliveries
            .lock()
            .await
            .values()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect();
        matched.sort_by_key(|d| d.created_at);
        Ok(matched)
    }

    async fn attempts_for(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let mut attempts = self
            .attempts
            .lock()
            .await
            .get(&delivery_id)
            .cloned()
            .unwrap_or_default();
        attempts.sort_by_key(|a| a.attempt_index);
        Ok(attempts)
    }

    async fn unfinished_deliveries(&self) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut unfinished: Vec<_> = self
            .deliveries
            .lock()
            .await
            .values()
            .filter(|d| matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Retrying))
            .cloned()
            .collect();
        unfinished.sort_by_key(|d| d.created_at);
        Ok(unfinished)
    }

    async fn increment_success(&self, webhook_id: WebhookId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.health.lock().await.entry(webhook_id).or_default().apply_success(at);
        Ok(())
    }

    async fn increment_failure(&self, webhook_id: WebhookId, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        self.health
            .lock()
            .await
            .entry(webhook_id)
            .or_default()
            .apply_failure(at, error);
        Ok(())
    }

    async fn webhook_health(&self, webhook_id: WebhookId) -> Result<WebhookHealth, StoreError> {
        Ok(self.health.lock().await.get(&webhook_id).cloned().unwrap_or_default())
    }
}
