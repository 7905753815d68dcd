use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::types::{Webhook, WebhookId};

/// Read access to webhook configuration.
///
/// The configuration store owns webhooks; the engine never writes through
/// this trait.
#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    /// All active webhooks (enabled, not deleted) subscribed to `event_type`.
    async fn list_active_webhooks_for_event(
        &self,
        event_type: &str,
    ) -> Result<Vec<Webhook>, RegistryError>;

    /// Look up a webhook by id regardless of its active state.
    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>, RegistryError>;
}

/// In-memory registry for embedded use and tests.
///
/// The mutating methods stand in for the configuration API.
#[derive(Default)]
pub struct InMemoryWebhookRegistry {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
}

impl InMemoryWebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a webhook.
    pub async fn upsert(&self, webhook: Webhook) {
        self.webhooks.write().await.insert(webhook.id, webhook);
    }

    /// Returns `false` if the webhook is unknown.
    pub async fn set_enabled(&self, id: WebhookId, enabled: bool) -> bool {
        match self.webhooks.write().await.get_mut(&id) {
            Some(webhook) => {
                webhook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Returns `false` if the webhook is unknown.
    pub async fn soft_delete(&self, id: WebhookId) -> bool {
        match self.webhooks.write().await.get_mut(&id) {
            Some(webhook) => {
                webhook.deleted = true;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: WebhookId) -> Option<Webhook> {
        self.webhooks.write().await.remove(&id)
    }
}

#[async_trait]
impl WebhookRegistry for InMemoryWebhookRegistry {
    async fn list_active_webhooks_for_event(
        &self,
        event_type: &str,
    ) -> Result<Vec<Webhook>, RegistryError> {
        let guard = self.webhooks.read().await;
        let mut matched: Vec<Webhook> = guard
            .values()
            .filter(|w| w.should_trigger_for(event_type))
            .cloned()
            .collect();
        matched.sort_by_key(|w| w.id);
        Ok(matched)
    }

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>, RegistryError> {
        Ok(self.webhooks.read().await.get(&id).cloned())
    }
}
