use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{DispatchError, StartError, StoreError};
use crate::executor::{worker_loop, DeliveryExecutor, Job, WorkerContext};
use crate::health::HealthRecorder;
use crate::registry::WebhookRegistry;
use crate::retry::{RetryPolicy, RetryScheduler, SchedulerMessage};
use crate::storage::DeliveryStore;
use crate::telemetry::metric_inc;
use crate::types::{
    DeliveryAttempt, DeliveryId, DeliveryStatus, Event, WebhookDelivery, WebhookHealth, WebhookId,
};

/// Entry point of the engine: fans events out to subscribed webhooks.
///
/// `dispatch` persists one `PENDING` delivery per matching webhook and
/// queues it for the worker pool; it never waits for delivery outcomes.
pub struct Dispatcher {
    ready_tx: Option<mpsc::Sender<Job>>,
    scheduler_tx: Option<mpsc::UnboundedSender<SchedulerMessage>>,
    health: Option<HealthRecorder>,
    is_running: AtomicBool,
    shutdown: Arc<Notify>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    health_handle: Option<JoinHandle<()>>,
    registry: Arc<dyn WebhookRegistry>,
    store: Arc<dyn DeliveryStore>,
    config: EngineConfig,
}

impl Dispatcher {
    /// Start workers, the retry scheduler and the health recorder.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn DeliveryStore>,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let executor = DeliveryExecutor::new(&config)?;

        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size);
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (health, health_handle) = HealthRecorder::spawn(store.clone());
        let shutdown = Arc::new(Notify::new());

        let ctx = Arc::new(WorkerContext {
            executor,
            global_semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            store: store.clone(),
            health: health.clone(),
            scheduler_tx: scheduler_tx.clone(),
        });

        let worker_handles = (0..config.worker_count)
            .map(|_| tokio::spawn(worker_loop(shared_ready_rx.clone(), ctx.clone())))
            .collect();

        let scheduler = RetryScheduler::new(
            RetryPolicy::from(&config),
            store.clone(),
            health.clone(),
            ready_tx.clone(),
        );
        let scheduler_handle = tokio::spawn(scheduler.run(scheduler_rx, shutdown.clone()));

        tracing::info!(
            target: "webhook_delivery",
            worker_count = config.worker_count,
            max_in_flight = config.max_in_flight,
            queue_size = config.queue_size,
            "Webhook dispatcher started"
        );

        Ok(Self {
            ready_tx: Some(ready_tx),
            scheduler_tx: Some(scheduler_tx),
            health: Some(health),
            is_running: AtomicBool::new(true),
            shutdown,
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            health_handle: Some(health_handle),
            registry,
            store,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fan an event out to every active webhook subscribed to its type.
    ///
    /// Returns the ids of the deliveries created. No subscriber is not an
    /// error. Only an unserializable payload, an unavailable registry or a
    /// stopped dispatcher are reported to the caller; delivery failures
    /// never are.
    pub async fn dispatch<P: Serialize>(&self, event: &Event<P>) -> Result<Vec<DeliveryId>, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        let Some(ready_tx) = self.ready_tx.as_ref() else {
            return Err(DispatchError::Shutdown);
        };

        let body = serde_json::to_string(&event.payload)?;

        let webhooks = self
            .registry
            .list_active_webhooks_for_event(&event.event_type)
            .await?;

        if webhooks.is_empty() {
            tracing::debug!(
                target: "webhook_delivery",
                event_id = %event.id,
                event_type = %event.event_type,
                "No active webhooks subscribed to event type"
            );
            metric_inc("webhook.dispatch.unmatched");
            return Ok(Vec::new());
        }

        tracing::info!(
            target: "webhook_delivery",
            event_id = %event.id,
            event_type = %event.event_type,
            webhook_count = webhooks.len(),
            "Dispatching event to subscribed webhooks"
        );

        let mut seen = HashSet::new();
        let mut created = Vec::with_capacity(webhooks.len());

        for webhook in webhooks {
            if !webhook.should_trigger_for(&event.event_type) || !seen.insert(webhook.id) {
                continue;
            }

            let delivery = WebhookDelivery::pending(&webhook, event.id, &event.event_type, body.clone());

            if let Err(e) = self.store.insert_delivery(&delivery).await {
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.id,
                    webhook_id = %webhook.id,
                    error = %e,
                    "Failed to create delivery record"
                );
                continue;
            }

            let id = delivery.id;
            let job = Job {
                delivery,
                webhook: Arc::new(webhook),
            };
            if ready_tx.send(job).await.is_err() {
                metric_inc("webhook.dispatch.shutdown");
                return Err(DispatchError::Shutdown);
            }

            metric_inc("webhook.dispatch.enqueued");
            created.push(id);
        }

        Ok(created)
    }

    /// Resubmit deliveries left `PENDING` or `RETRYING` by a previous run.
    ///
    /// `RETRYING` deliveries keep their `next_retry_at`. A delivery whose
    /// webhook no longer exists is finalized as `FAILED`. Returns the number
    /// of deliveries resubmitted.
    pub async fn resume_unfinished(&self) -> Result<usize, StoreError> {
        let (Some(ready_tx), Some(scheduler_tx)) = (self.ready_tx.as_ref(), self.scheduler_tx.as_ref()) else {
            return Ok(0);
        };

        let mut resumed = 0usize;
        for mut delivery in self.store.unfinished_deliveries().await? {
            let webhook = match self.registry.get_webhook(delivery.webhook_id).await {
                Ok(Some(webhook)) => webhook,
                Ok(None) => {
                    self.abandon_orphan(&mut delivery).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        delivery_id = %delivery.id,
                        webhook_id = %delivery.webhook_id,
                        error = %e,
                        "Failed to load webhook for unfinished delivery"
                    );
                    continue;
                }
            };

            let status = delivery.status;
            let next_retry_at = delivery.next_retry_at;
            let job = Job {
                delivery,
                webhook: Arc::new(webhook),
            };

            let submitted = match status {
                DeliveryStatus::Retrying => scheduler_tx
                    .send(SchedulerMessage::Resume {
                        job,
                        at: next_retry_at.unwrap_or_else(Utc::now),
                    })
                    .is_ok(),
                _ => ready_tx.send(job).await.is_ok(),
            };
            if submitted {
                resumed += 1;
            }
        }

        if resumed > 0 {
            tracing::info!(
                target: "webhook_delivery",
                resumed,
                "Resumed unfinished webhook deliveries"
            );
        }
        Ok(resumed)
    }

    async fn abandon_orphan(&self, delivery: &mut WebhookDelivery) {
        let now = Utc::now();
        delivery.error_message = Some("webhook no longer exists".to_string());
        if !delivery.mark_failed(now) {
            return;
        }

        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            "Abandoning delivery; webhook no longer exists"
        );

        if let Err(e) = self.store.update_delivery(delivery).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                error = %e,
                "Failed to update delivery status to failed"
            );
        }
        if let Some(health) = self.health.as_ref() {
            health.record_failure(delivery.webhook_id, now, "webhook no longer exists");
        }
    }

    /// Stop accepting events and wait for in-flight work.
    ///
    /// Queued attempts still run. Retries that were armed, or become due
    /// during the drain, stay persisted as `RETRYING` and are picked up by
    /// [`resume_unfinished`](Self::resume_unfinished) on the next start.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.take();
        self.scheduler_tx.take();
        self.health.take();
        self.shutdown.notify_one();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.health_handle.take() {
            let _ = handle.await;
        }

        tracing::info!(target: "webhook_delivery", "Webhook dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        self.store.get_delivery(id).await
    }

    pub async fn deliveries_for_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.store.deliveries_for_webhook(webhook_id).await
    }

    pub async fn attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        self.store.attempts_for(delivery_id).await
    }

    pub async fn webhook_health(&self, webhook_id: WebhookId) -> Result<WebhookHealth, StoreError> {
        self.store.webhook_health(webhook_id).await
    }
}
