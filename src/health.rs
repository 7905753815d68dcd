//! Single-writer owner of webhook health counters.
//!
//! Every finalized delivery sends one message here; the recorder applies
//! them one at a time against the store's increment operations, so
//! concurrent completions for the same webhook never race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::DeliveryStore;
use crate::types::WebhookId;

#[derive(Debug)]
enum HealthUpdate {
    Success {
        webhook_id: WebhookId,
        at: DateTime<Utc>,
    },
    Failure {
        webhook_id: WebhookId,
        at: DateTime<Utc>,
        error: String,
    },
}

/// Handle for submitting counter updates. Cheap to clone.
#[derive(Clone)]
pub(crate) struct HealthRecorder {
    tx: mpsc::UnboundedSender<HealthUpdate>,
}

impl HealthRecorder {
    /// Spawn the recorder task. It exits once every handle is dropped and
    /// the backlog has been applied.
    pub(crate) fn spawn(store: Arc<dyn DeliveryStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HealthUpdate>();

        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let (webhook_id, result) = match &update {
                    HealthUpdate::Success { webhook_id, at } => {
                        (*webhook_id, store.increment_success(*webhook_id, *at).await)
                    }
                    HealthUpdate::Failure { webhook_id, at, error } => {
                        (*webhook_id, store.increment_failure(*webhook_id, *at, error).await)
                    }
                };

                if let Err(e) = result {
                    tracing::error!(
                        target: "webhook_delivery",
                        webhook_id = %webhook_id,
                        error = %e,
                        "Failed to update webhook health counters"
                    );
                }
            }
        });

        (Self { tx }, handle)
    }

    pub(crate) fn record_success(&self, webhook_id: WebhookId, at: DateTime<Utc>) {
        self.send(HealthUpdate::Success { webhook_id, at });
    }

    pub(crate) fn record_failure(&self, webhook_id: WebhookId, at: DateTime<Utc>, error: impl Into<String>) {
        self.send(HealthUpdate::Failure {
            webhook_id,
            at,
            error: error.into(),
        });
    }

    fn send(&self, update: HealthUpdate) {
        if self.tx.send(update).is_err() {
            tracing::warn!(
                target: "webhook_delivery",
                "Health recorder stopped; counter update dropped"
            );
        }
    }
}
