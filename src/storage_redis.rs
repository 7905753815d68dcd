#[cfg(feature = "redis")]
use std::collections::HashMap;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use chrono::{DateTime, Utc};
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::error::StoreError;
#[cfg(feature = "redis")]
use crate::storage::DeliveryStore;
#[cfg(feature = "redis")]
use crate::types::{DeliveryAttempt, DeliveryId, DeliveryStatus, WebhookDelivery, WebhookHealth, WebhookId};

/// Delivery store backed by Redis.
///
/// Layout under `prefix`:
/// - `delivery:{id}`: delivery JSON
/// - `webhook:{id}:deliveries`: zset of delivery ids scored by creation time
/// - `unfinished`: set of `PENDING`/`RETRYING` delivery ids
/// - `attempts:{id}`: hash of attempt index to attempt JSON
/// - `health:{id}`: hash of counters, incremented with `HINCRBY`
#[cfg(feature = "redis")]
pub struct RedisDeliveryStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisDeliveryStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn delivery_key(&self, id: &str) -> String {
        format!("{}:delivery:{}", self.prefix, id)
    }

    fn webhook_key(&self, webhook_id: WebhookId) -> String {
        format!("{}:webhook:{}:deliveries", self.prefix, webhook_id)
    }

    fn unfinished_key(&self) -> String {
        format!("{}:unfinished", self.prefix)
    }

    fn attempts_key(&self, delivery_id: DeliveryId) -> String {
        format!("{}:attempts:{}", self.prefix, delivery_id)
    }

    fn health_key(&self, webhook_id: WebhookId) -> String {
        format!("{}:health:{}", self.prefix, webhook_id)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.client.get_tokio_connection().await?)
    }

    async fn write_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let id = delivery.id.to_string();
        let payload = serde_json::to_string(delivery)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.delivery_key(&id), payload)
            .ignore()
            .zadd(
                self.webhook_key(delivery.webhook_id),
                &id,
                delivery.created_at.timestamp_millis(),
            )
            .ignore();

        if matches!(delivery.status, DeliveryStatus::Pending | DeliveryStatus::Retrying) {
            pipe.sadd(self.unfinished_key(), &id).ignore();
        } else {
            pipe.srem(self.unfinished_key(), &id).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn load_deliveries(&self, ids: Vec<String>) -> Result<Vec<WebhookDelivery>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = ids.iter().map(|id| self.delivery_key(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut deliveries = values
            .into_iter()
            .flatten()
            .map(|v| serde_json::from_str::<WebhookDelivery>(&v))
            .collect::<Result<Vec<_>, _>>()?;
        deliveries.sort_by_key(|d| d.created_at);
        Ok(deliveries)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl DeliveryStore for RedisDeliveryStore {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.write_delivery(delivery).await
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(self.delivery_key(&delivery.id.to_string())).await?;
        if !exists {
            return Err(StoreError::NotFound(delivery.id.to_string()));
        }
        self.write_delivery(delivery).await
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(attempt)?;
        conn.hset::<_, _, _, ()>(self.attempts_key(attempt.delivery_id), attempt.attempt_index, payload)
            .await?;
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.delivery_key(&id.to_string())).await?;
        Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    async fn deliveries_for_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.zrange(self.webhook_key(webhook_id), 0, -1).await?;
        self.load_deliveries(ids).await
    }

    async fn attempts_for(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn.hvals(self.attempts_key(delivery_id)).await?;
        let mut attempts = values
            .iter()
            .map(|v| serde_json::from_str::<DeliveryAttempt>(v))
            .collect::<Result<Vec<_>, _>>()?;
        attempts.sort_by_key(|a| a.attempt_index);
        Ok(attempts)
    }

    async fn unfinished_deliveries(&self) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.unfinished_key()).await?;
        self.load_deliveries(ids).await
    }

    async fn increment_success(&self, webhook_id: WebhookId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.health_key(webhook_id);
        redis::pipe()
            .atomic()
            .hincr(&key, "success_count", 1)
            .ignore()
            .hset(&key, "last_success_at", at.to_rfc3339())
            .ignore()
            .hdel(&key, "last_error")
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment_failure(&self, webhook_id: WebhookId, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.health_key(webhook_id);
        redis::pipe()
            .atomic()
            .hincr(&key, "failure_count", 1)
            .ignore()
            .hset(&key, "last_failure_at", at.to_rfc3339())
            .ignore()
            .hset(&key, "last_error", error)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn webhook_health(&self, webhook_id: WebhookId) -> Result<WebhookHealth, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.health_key(webhook_id)).await?;

        let count = |name: &str| fields.get(name).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let timestamp = |name: &str| {
            fields
                .get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        Ok(WebhookHealth {
            success_count: count("success_count"),
            failure_count: count("failure_count"),
            last_success_at: timestamp("last_success_at"),
            last_failure_at: timestamp("last_failure_at"),
            last_error: fields.get("last_error").cloned(),
        })
    }
}
