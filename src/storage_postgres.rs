#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::storage::DeliveryStore;
#[cfg(feature = "postgres")]
use crate::types::{DeliveryAttempt, DeliveryId, WebhookDelivery, WebhookHealth, WebhookId};

#[cfg(feature = "postgres")]
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id UUID PRIMARY KEY,
    webhook_id UUID NOT NULL,
    status TEXT NOT NULL,
    next_retry_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    payload JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS webhook_deliveries_webhook_idx
    ON webhook_deliveries (webhook_id, created_at);
CREATE INDEX IF NOT EXISTS webhook_deliveries_unfinished_idx
    ON webhook_deliveries (created_at) WHERE status IN ('PENDING', 'RETRYING');

CREATE TABLE IF NOT EXISTS webhook_delivery_attempts (
    delivery_id UUID NOT NULL,
    attempt_index INTEGER NOT NULL,
    payload JSONB NOT NULL,
    PRIMARY KEY (delivery_id, attempt_index)
);

CREATE TABLE IF NOT EXISTS webhook_health (
    webhook_id UUID PRIMARY KEY,
    success_count BIGINT NOT NULL DEFAULT 0,
    failure_count BIGINT NOT NULL DEFAULT 0,
    last_success_at TIMESTAMPTZ,
    last_failure_at TIMESTAMPTZ,
    last_error TEXT
);
";

/// Delivery store backed by PostgreSQL.
///
/// Records are kept as JSONB with the columns the engine filters on
/// promoted alongside. Health counters are incremented in SQL.
#[cfg(feature = "postgres")]
pub struct PostgresDeliveryStore {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresDeliveryStore {
    /// Wrap a connected client, creating the tables if needed.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client.batch_execute(SCHEMA).await?;
        Ok(Self { client })
    }

    fn rows_to_deliveries(rows: Vec<tokio_postgres::Row>) -> Result<Vec<WebhookDelivery>, StoreError> {
        rows.into_iter()
            .map(|row| -> Result<WebhookDelivery, StoreError> {
                let payload: serde_json::Value = row.try_get(0)?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let payload = serde_json::to_value(delivery)?;
        self.client
            .execute(
                "INSERT INTO webhook_deliveries (id, webhook_id, status, next_retry_at, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &delivery.id.0,
                    &delivery.webhook_id.0,
                    &delivery.status.as_str(),
                    &delivery.next_retry_at,
                    &delivery.created_at,
                    &payload,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let payload = serde_json::to_value(delivery)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $2, next_retry_at = $3, payload = $4
                 WHERE id = $1",
                &[
                    &delivery.id.0,
                    &delivery.status.as_str(),
                    &delivery.next_retry_at,
                    &payload,
                ],
            )
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(delivery.id.to_string()));
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        let payload = serde_json::to_value(attempt)?;
        let index = i32::try_from(attempt.attempt_index).unwrap_or(i32::MAX);
        self.client
            .execute(
                "INSERT INTO webhook_delivery_attempts (delivery_id, attempt_index, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (delivery_id, attempt_index) DO UPDATE SET payload = EXCLUDED.payload",
                &[&attempt.delivery_id.0, &index, &payload],
            )
            .await?;
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM webhook_deliveries WHERE id = $1", &[&id.0])
            .await?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get(0)?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn deliveries_for_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_deliveries WHERE webhook_id = $1 ORDER BY created_at",
                &[&webhook_id.0],
            )
            .await?;
        Self::rows_to_deliveries(rows)
    }

    async fn attempts_for(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_delivery_attempts WHERE delivery_id = $1 ORDER BY attempt_index",
                &[&delivery_id.0],
            )
            .await?;

        rows.into_iter()
            .map(|row| -> Result<DeliveryAttempt, StoreError> {
                let payload: serde_json::Value = row.try_get(0)?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }

    async fn unfinished_deliveries(&self) -> Result<Vec<WebhookDelivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_deliveries
                 WHERE status IN ('PENDING', 'RETRYING')
                 ORDER BY created_at",
                &[],
            )
            .await?;
        Self::rows_to_deliveries(rows)
    }

    async fn increment_success(&self, webhook_id: WebhookId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhook_health (webhook_id, success_count, last_success_at)
                 VALUES ($1, 1, $2)
                 ON CONFLICT (webhook_id) DO UPDATE SET
                     success_count = webhook_health.success_count + 1,
                     last_success_at = EXCLUDED.last_success_at,
                     last_error = NULL",
                &[&webhook_id.0, &at],
            )
            .await?;
        Ok(())
    }

    async fn increment_failure(&self, webhook_id: WebhookId, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhook_health (webhook_id, failure_count, last_failure_at, last_error)
                 VALUES ($1, 1, $2, $3)
                 ON CONFLICT (webhook_id) DO UPDATE SET
                     failure_count = webhook_health.failure_count + 1,
                     last_failure_at = EXCLUDED.last_failure_at,
                     last_error = EXCLUDED.last_error",
                &[&webhook_id.0, &at, &error],
            )
            .await?;
        Ok(())
    }

    async fn webhook_health(&self, webhook_id: WebhookId) -> Result<WebhookHealth, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT success_count, failure_count, last_success_at, last_failure_at, last_error
                 FROM webhook_health WHERE webhook_id = $1",
                &[&webhook_id.0],
            )
            .await?;

        let Some(row) = row else {
            return Ok(WebhookHealth::default());
        };

        let success_count: i64 = row.try_get(0)?;
        let failure_count: i64 = row.try_get(1)?;
        Ok(WebhookHealth {
            success_count: success_count.max(0) as u64,
            failure_count: failure_count.max(0) as u64,
            last_success_at: row.try_get(2)?,
            last_failure_at: row.try_get(3)?,
            last_error: row.try_get(4)?,
        })
    }
}
