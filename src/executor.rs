use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::config::{EngineConfig, DELIVERY_HEADER, EVENT_HEADER};
use crate::error::{AttemptOutcome, FailureReason};
use crate::health::HealthRecorder;
use crate::retry::SchedulerMessage;
use crate::signing::signature_header;
use crate::storage::DeliveryStore;
use crate::telemetry::{metric_inc, metric_inc_webhook};
use crate::types::{truncate, DeliveryAttempt, HttpMethod, Webhook, WebhookDelivery};

/// A unit of work consumed by workers: one attempt of one delivery,
/// together with the webhook snapshot it was created against.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub delivery: WebhookDelivery,
    pub webhook: Arc<Webhook>,
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: AttemptOutcome,
    pub attempt: DeliveryAttempt,
}

/// Performs the outbound HTTP call for one attempt.
///
/// The executor never returns an error: transport failures, timeouts and
/// non-2xx answers all become [`AttemptOutcome::Failed`].
pub struct DeliveryExecutor {
    client: reqwest::Client,
    signature_header: String,
    user_agent: String,
    max_response_body_len: usize,
    max_error_len: usize,
}

impl DeliveryExecutor {
    pub fn new(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            signature_header: config.signature_header.clone(),
            user_agent: config.user_agent.clone(),
            max_response_body_len: config.max_response_body_len,
            max_error_len: config.max_error_len,
        })
    }

    /// Send `delivery` to `webhook` once and classify the result.
    pub async fn execute(&self, delivery: &WebhookDelivery, webhook: &Webhook) -> ExecutionResult {
        let started_at = Utc::now();
        let body = delivery.request_payload.as_bytes();
        let (header_map, request_headers) = self.build_headers(delivery, webhook, body);

        let start = Instant::now();
        let result = self.send(webhook, header_map, body).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut attempt = DeliveryAttempt {
            delivery_id: delivery.id,
            attempt_index: delivery.retry_count,
            started_at,
            request_headers,
            status_code: None,
            response_body: None,
            duration_ms,
            error_message: None,
            succeeded: false,
        };

        let outcome = match result {
            Ok((status, response_body)) => {
                attempt.status_code = Some(status);
                attempt.response_body = Some(truncate(&response_body, self.max_response_body_len));
                if (200..300).contains(&status) {
                    attempt.succeeded = true;
                    AttemptOutcome::Delivered
                } else {
                    AttemptOutcome::Failed(FailureReason::HttpStatus(status))
                }
            }
            Err(reason) => AttemptOutcome::Failed(reason),
        };

        if let AttemptOutcome::Failed(reason) = &outcome {
            attempt.error_message = Some(truncate(&reason.to_string(), self.max_error_len));
        }

        ExecutionResult { outcome, attempt }
    }

    /// Custom headers first, then engine headers, which win on a
    /// case-insensitive name clash. Invalid names or values are skipped.
    fn build_headers(
        &self,
        delivery: &WebhookDelivery,
        webhook: &Webhook,
        body: &[u8],
    ) -> (HeaderMap, BTreeMap<String, String>) {
        let mut engine_headers = vec![
            (CONTENT_TYPE.as_str().to_string(), webhook.content_type.clone()),
            (USER_AGENT.as_str().to_string(), self.user_agent.clone()),
            (EVENT_HEADER.to_string(), delivery.event_type.clone()),
            (DELIVERY_HEADER.to_string(), delivery.id.to_string()),
        ];
        if let Some(header) = signature_header(&self.signature_header, webhook.signing_secret(), body) {
            engine_headers.push(header);
        }

        let reserved = |name: &str| {
            engine_headers
                .iter()
                .any(|(engine, _)| engine.eq_ignore_ascii_case(name))
        };

        let custom = webhook
            .headers
            .iter()
            .filter(|(name, _)| !reserved(name))
            .map(|(name, value)| (name.clone(), value.clone()));

        let mut header_map = HeaderMap::new();
        let mut snapshot = BTreeMap::new();

        for (name, value) in custom.collect::<Vec<_>>().into_iter().chain(engine_headers.clone()) {
            let parsed = HeaderName::from_bytes(name.as_bytes())
                .ok()
                .zip(HeaderValue::from_str(&value).ok());
            match parsed {
                Some((header_name, header_value)) => {
                    header_map.insert(header_name, header_value);
                    snapshot.insert(name, value);
                }
                None => {
                    tracing::warn!(
                        target: "webhook_delivery",
                        delivery_id = %delivery.id,
                        webhook_id = %webhook.id,
                        header = %name,
                        "Skipping invalid header"
                    );
                }
            }
        }

        (header_map, snapshot)
    }

    async fn send(
        &self,
        webhook: &Webhook,
        headers: HeaderMap,
        body: &[u8],
    ) -> Result<(u16, String), FailureReason> {
        let url = reqwest::Url::parse(&webhook.url)
            .map_err(|e| FailureReason::InvalidRequest(format!("{}: {e}", webhook.url)))?;

        let response = self
            .client
            .request(to_reqwest_method(webhook.method), url)
            .headers(headers)
            .body(body.to_vec())
            .timeout(webhook.timeout())
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn classify_error(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else if err.is_connect() {
        FailureReason::Connect(err.to_string())
    } else if err.is_builder() {
        FailureReason::InvalidRequest(err.to_string())
    } else {
        FailureReason::Network(err.to_string())
    }
}

/// Shared context for all workers.
pub(crate) struct WorkerContext {
    pub executor: DeliveryExecutor,

    /// Global concurrency limiter.
    pub global_semaphore: Arc<Semaphore>,

    pub store: Arc<dyn DeliveryStore>,
    pub health: HealthRecorder,

    /// Failed attempts are handed to the retry scheduler.
    pub scheduler_tx: mpsc::UnboundedSender<SchedulerMessage>,
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls jobs from the shared ready queue
/// - Holds a global permit only for the HTTP call
/// - Finalizes successes itself and hands failures to the scheduler
///
/// Exits once the ready queue is closed and drained.
pub(crate) async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Job>>>, ctx: Arc<WorkerContext>) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };

        process_job(job, &ctx).await;
    }
}

async fn process_job(job: Job, ctx: &WorkerContext) {
    let Job { mut delivery, webhook } = job;

    if delivery.status.is_terminal() {
        return;
    }

    let Ok(permit) = ctx.global_semaphore.acquire().await else {
        return;
    };
    let result = ctx.executor.execute(&delivery, &webhook).await;
    drop(permit);

    if let Err(e) = ctx.store.record_attempt(&result.attempt).await {
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            error = %e,
            "Failed to record delivery attempt"
        );
    }

    delivery.apply_attempt(&result.attempt);

    match result.outcome {
        AttemptOutcome::Delivered => {
            let now = Utc::now();
            delivery.mark_success(now);

            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event_type = %delivery.event_type,
                method = webhook.method.as_str(),
                status_code = result.attempt.status_code,
                duration_ms = result.attempt.duration_ms,
                attempt = result.attempt.attempt_index + 1,
                "Webhook delivery succeeded"
            );

            ctx.health.record_success(webhook.id, now);
            metric_inc("webhook.delivery.success");
            metric_inc_webhook("webhook.delivery.success.webhook", &webhook.id);

            if let Err(e) = ctx.store.update_delivery(&delivery).await {
                tracing::error!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    error = %e,
                    "Failed to update delivery status to success; handing to scheduler"
                );
                let message = SchedulerMessage::Persist {
                    job: Job { delivery, webhook },
                };
                if ctx.scheduler_tx.send(message).is_err() {
                    tracing::error!(
                        target: "webhook_delivery",
                        "Retry scheduler stopped; success left unfinished in store"
                    );
                }
            }
        }

        AttemptOutcome::Failed(reason) => {
            tracing::warn!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event_type = %delivery.event_type,
                method = webhook.method.as_str(),
                status_code = result.attempt.status_code,
                duration_ms = result.attempt.duration_ms,
                attempt = result.attempt.attempt_index + 1,
                error = %reason,
                "Webhook delivery attempt failed"
            );
            metric_inc("webhook.delivery.failure");

            let message = SchedulerMessage::Failed {
                job: Job { delivery, webhook },
                reason,
            };
            if ctx.scheduler_tx.send(message).is_err() {
                tracing::error!(
                    target: "webhook_delivery",
                    "Retry scheduler stopped; failed attempt left unfinished in store"
                );
            }
        }
    }
}
