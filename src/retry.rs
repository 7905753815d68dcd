use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

use crate::config::EngineConfig;
use crate::error::{FailureReason, StoreError};
use crate::executor::Job;
use crate::health::HealthRecorder;
use crate::storage::DeliveryStore;
use crate::telemetry::{metric_inc, metric_inc_webhook};
use crate::types::Webhook;

/// Exponential backoff: `base_delay_ms * 2^attempt_index`, capped at
/// `max_delay_ms`.
pub fn backoff_delay(base_delay_ms: u64, attempt_index: u32, max_delay_ms: u64) -> Duration {
    let factor = 2u64.checked_pow(attempt_index).unwrap_or(u64::MAX);
    Duration::from_millis(base_delay_ms.saturating_mul(factor).min(max_delay_ms))
}

/// Engine-wide retry knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub fail_fast_on_client_error: bool,
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_delay_ms: config.max_retry_delay_ms,
            jitter_ms: config.retry_jitter_ms,
            fail_fast_on_client_error: config.fail_fast_on_client_error,
        }
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    /// Retry budget used up.
    Exhausted,
    /// Client error under the fail-fast policy.
    NonRetryable,
}

impl RetryPolicy {
    /// Decide the fate of the attempt with zero-based `attempt_index`.
    pub fn decide(&self, webhook: &Webhook, attempt_index: u32, reason: &FailureReason) -> RetryDecision {
        if self.fail_fast_on_client_error && reason.is_client_error() {
            return RetryDecision::NonRetryable;
        }
        if attempt_index >= webhook.max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = backoff_delay(webhook.retry_delay_ms, attempt_index, self.max_delay_ms);
        RetryDecision::Retry {
            delay: delay + jitter_delay(self.jitter_ms),
        }
    }
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Messages accepted by the scheduler task.
#[derive(Debug)]
pub(crate) enum SchedulerMessage {
    /// An attempt failed; decide between retry and finalization.
    Failed { job: Job, reason: FailureReason },
    /// A persisted `RETRYING` delivery to re-arm after restart.
    Resume { job: Job, at: DateTime<Utc> },
    /// A finalized delivery whose write to the store failed.
    Persist { job: Job },
}

/// First wait before re-trying a failed store write.
const PERSIST_RETRY_BASE_MS: u64 = 100;
/// Ceiling on the wait between store write attempts.
const PERSIST_RETRY_MAX_MS: u64 = 30_000;

#[derive(Debug)]
enum HeapEntry {
    /// Hand the job back to the ready queue.
    Release(Job),
    /// Write the delivery to the store, then release it at `release_at` if set.
    Persist {
        job: Job,
        release_at: Option<Instant>,
        failures: u32,
    },
}

#[derive(Debug)]
struct TimedJob {
    ready_at: Instant,
    entry: HeapEntry,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Owns every armed retry in a min-heap keyed by ready instant.
///
/// A retry is armed only after its `RETRYING` state has been written to the
/// store, and it re-enters the ready queue only once its delay has elapsed,
/// so attempts of one delivery never overlap. A failed store write is kept
/// in the heap and re-tried with capped backoff until it succeeds.
pub(crate) struct RetryScheduler {
    policy: RetryPolicy,
    store: Arc<dyn DeliveryStore>,
    health: HealthRecorder,

    /// `None` once draining for shutdown.
    ready_tx: Option<mpsc::Sender<Job>>,
    heap: BinaryHeap<TimedJob>,
}

impl RetryScheduler {
    pub(crate) fn new(
        policy: RetryPolicy,
        store: Arc<dyn DeliveryStore>,
        health: HealthRecorder,
        ready_tx: mpsc::Sender<Job>,
    ) -> Self {
        Self {
            policy,
            store,
            health,
            ready_tx: Some(ready_tx),
            heap: BinaryHeap::new(),
        }
    }

    /// Run until every sender of `rx` is gone.
    ///
    /// After `shutdown` fires the scheduler stops arming retries but keeps
    /// recording failures reported by workers that are still draining.
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<SchedulerMessage>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            self.release_due().await;

            let next_ready = self.heap.peek().map(|t| t.ready_at);
            let accepting = self.ready_tx.is_some();

            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = sleep_until(next_ready.unwrap_or_else(Instant::now)), if next_ready.is_some() => {}
                _ = shutdown.notified(), if accepting => self.begin_drain(),
            }
        }
    }

    /// Run every heap entry whose instant has passed.
    async fn release_due(&mut self) {
        while self.heap.peek().is_some_and(|t| t.ready_at <= Instant::now()) {
            let Some(timed) = self.heap.pop() else { break };
            match timed.entry {
                HeapEntry::Release(job) => self.release(job).await,
                HeapEntry::Persist {
                    job,
                    release_at,
                    failures,
                } => self.persist(job, release_at, failures).await,
            }
        }
    }

    async fn release(&mut self, job: Job) {
        let Some(ready_tx) = self.ready_tx.as_ref() else {
            return;
        };
        if ready_tx.send(job).await.is_err() {
            tracing::warn!(
                target: "webhook_delivery",
                "Ready queue closed; retry left unfinished in store"
            );
        }
    }

    fn begin_drain(&mut self) {
        self.ready_tx = None;
        if !self.heap.is_empty() {
            tracing::info!(
                target: "webhook_delivery",
                pending_retries = self.heap.len(),
                "Retry scheduler draining; armed retries remain persisted as unfinished"
            );
        }
        self.heap.clear();
    }

    async fn handle(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Failed { job, reason } => self.on_failure(job, reason).await,
            SchedulerMessage::Resume { job, at } => {
                let delay = (at - Utc::now()).to_std().unwrap_or_default();
                self.push(Instant::now() + delay, HeapEntry::Release(job));
            }
            SchedulerMessage::Persist { job } => self.persist(job, None, 0).await,
        }
    }

    async fn on_failure(&mut self, job: Job, reason: FailureReason) {
        let Job { mut delivery, webhook } = job;
        let attempt_index = delivery.retry_count;
        let now = Utc::now();

        match self.policy.decide(&webhook, attempt_index, &reason) {
            RetryDecision::Retry { delay } => {
                if !delivery.mark_retrying(delay, now) {
                    return;
                }

                tracing::info!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    retry_count = delivery.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Webhook delivery scheduled for retry"
                );

                metric_inc("webhook.delivery.retry_scheduled");
                let release_at = Instant::now() + delay;
                self.persist(Job { delivery, webhook }, Some(release_at), 0).await;
            }

            decision @ (RetryDecision::Exhausted | RetryDecision::NonRetryable) => {
                if !delivery.mark_failed(now) {
                    return;
                }
                let error = delivery
                    .error_message
                    .clone()
                    .unwrap_or_else(|| reason.to_string());

                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    event_type = %delivery.event_type,
                    retry_count = delivery.retry_count,
                    non_retryable = decision == RetryDecision::NonRetryable,
                    error = %error,
                    "Webhook delivery failed permanently"
                );

                self.health.record_failure(webhook.id, now, error);
                metric_inc("webhook.delivery.failed");
                metric_inc_webhook("webhook.delivery.failed.webhook", &webhook.id);

                self.persist(Job { delivery, webhook }, None, 0).await;
            }
        }
    }

    /// Write the delivery; on success release it at `release_at`, if any.
    ///
    /// The RETRYING state must be durable before the retry is armed, so a
    /// failed write parks the job in the heap and tries the write again.
    async fn persist(&mut self, job: Job, release_at: Option<Instant>, failures: u32) {
        let error = match self.store.update_delivery(&job.delivery).await {
            Ok(()) => {
                if let Some(at) = release_at {
                    self.push(at, HeapEntry::Release(job));
                }
                return;
            }
            Err(e) => e,
        };

        if let StoreError::NotFound(_) = error {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %job.delivery.id,
                status = job.delivery.status.as_str(),
                "Delivery record missing from store; dropping state update"
            );
            return;
        }

        let wait = backoff_delay(PERSIST_RETRY_BASE_MS, failures, PERSIST_RETRY_MAX_MS);
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %job.delivery.id,
            status = job.delivery.status.as_str(),
            error = %error,
            retry_in_ms = wait.as_millis() as u64,
            "Failed to persist delivery state; will retry"
        );

        self.push(
            Instant::now() + wait,
            HeapEntry::Persist {
                job,
                release_at,
                failures: failures.saturating_add(1),
            },
        );
    }

    /// No-op once draining; the store keeps the last persisted state.
    fn push(&mut self, ready_at: Instant, entry: HeapEntry) {
        if self.ready_tx.is_none() {
            return;
        }
        self.heap.push(TimedJob { ready_at, entry });
    }
}
