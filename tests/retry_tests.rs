//! Retry scheduling, exhaustion and the fail-fast policy.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use webhook_engine::{
    DeliveryStatus, DeliveryStore, Dispatcher, EngineConfig, Event, InMemoryWebhookRegistry, Webhook,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

async fn scripted_server(responder: ScriptedResponder) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(responder)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn recovers_after_transient_failures() {
    let responder = ScriptedResponder::new(&[500, 500, 200]);
    let server = scripted_server(responder.clone()).await;

    let mut engine = start_engine(test_config());
    let webhook = Webhook::new("flaky", server.uri())
        .subscribe("task.completed")
        .with_max_retries(2)
        .with_retry_delay_ms(20);
    engine.registry.upsert(webhook.clone()).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({ "taskId": 1 })))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.retry_count, 2);
    assert_eq!(delivery.status_code, Some(200));
    assert_eq!(delivery.next_retry_at, None);
    assert_eq!(delivery.error_message, None);
    assert_eq!(responder.calls(), 3);

    let attempts = engine.dispatcher.attempts(delivery.id).await.unwrap();
    let statuses: Vec<_> = attempts.iter().map(|a| a.status_code).collect();
    assert_eq!(statuses, vec![Some(500), Some(500), Some(200)]);
    let indexes: Vec<_> = attempts.iter().map(|a| a.attempt_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);

    engine.dispatcher.shutdown().await;
    let health = engine.dispatcher.webhook_health(webhook.id).await.unwrap();
    assert_eq!(health.success_count, 1);
    assert_eq!(health.failure_count, 0);
}

#[tokio::test]
async fn exhausts_retry_budget_then_fails() {
    let responder = ScriptedResponder::always(503);
    let server = scripted_server(responder.clone()).await;

    let mut engine = start_engine(test_config());
    let webhook = Webhook::new("broken", server.uri())
        .subscribe("task.completed")
        .with_max_retries(2)
        .with_retry_delay_ms(20);
    engine.registry.upsert(webhook.clone()).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.retry_count, 2);
    assert_eq!(delivery.status_code, Some(503));
    assert_eq!(delivery.error_message.as_deref(), Some("HTTP 503"));
    assert!(delivery.completed_at.is_some());

    // No further attempts after the terminal state.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(responder.calls(), 3);

    engine.dispatcher.shutdown().await;
    let health = engine.dispatcher.webhook_health(webhook.id).await.unwrap();
    assert_eq!(health.failure_count, 1);
    assert_eq!(health.success_count, 0);
    assert_eq!(health.last_error.as_deref(), Some("HTTP 503"));
}

#[tokio::test]
async fn zero_retries_means_single_attempt() {
    let responder = ScriptedResponder::always(500);
    let server = scripted_server(responder.clone()).await;

    let engine = start_engine(test_config());
    let webhook = Webhook::new("once", server.uri())
        .subscribe("task.completed")
        .with_max_retries(0);
    engine.registry.upsert(webhook).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.retry_count, 0);
    assert_eq!(responder.calls(), 1);
}

#[tokio::test]
async fn retrying_state_is_visible_between_attempts() {
    let responder = ScriptedResponder::new(&[500, 200]);
    let server = scripted_server(responder.clone()).await;

    let engine = start_engine(test_config());
    let webhook = Webhook::new("slow-retry", server.uri())
        .subscribe("task.completed")
        .with_retry_delay_ms(500);
    engine.registry.upsert(webhook).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();

    let retrying = wait_for_status(&*engine.store, ids[0], DeliveryStatus::Retrying).await;
    assert_eq!(retrying.retry_count, 1);
    assert_eq!(retrying.status_code, Some(500));
    let next = retrying.next_retry_at.expect("next retry time");
    assert!(next > retrying.updated_at);

    let done = wait_for_terminal(&*engine.store, ids[0]).await;
    assert_eq!(done.status, DeliveryStatus::Success);
    assert_eq!(done.retry_count, 1);
}

#[tokio::test]
async fn client_errors_are_retried_by_default() {
    let responder = ScriptedResponder::always(404);
    let server = scripted_server(responder.clone()).await;

    let engine = start_engine(test_config());
    let webhook = Webhook::new("missing", server.uri())
        .subscribe("task.completed")
        .with_max_retries(1)
        .with_retry_delay_ms(10);
    engine.registry.upsert(webhook).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.retry_count, 1);
    assert_eq!(responder.calls(), 2);
}

#[tokio::test]
async fn fail_fast_finalizes_client_errors_immediately() {
    let responder = ScriptedResponder::always(400);
    let server = scripted_server(responder.clone()).await;

    let config = EngineConfig {
        fail_fast_on_client_error: true,
        ..test_config()
    };
    let engine = start_engine(config);
    let webhook = Webhook::new("strict", server.uri())
        .subscribe("task.completed")
        .with_max_retries(3)
        .with_retry_delay_ms(10);
    engine.registry.upsert(webhook).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.retry_count, 0);
    assert_eq!(responder.calls(), 1);
}

#[tokio::test]
async fn fail_fast_still_retries_rate_limiting() {
    let responder = ScriptedResponder::new(&[429, 200]);
    let server = scripted_server(responder.clone()).await;

    let config = EngineConfig {
        fail_fast_on_client_error: true,
        ..test_config()
    };
    let engine = start_engine(config);
    let webhook = Webhook::new("throttled", server.uri())
        .subscribe("task.completed")
        .with_retry_delay_ms(10);
    engine.registry.upsert(webhook).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.retry_count, 1);
}

#[tokio::test]
async fn backoff_doubles_between_attempts() {
    let responder = ScriptedResponder::new(&[500, 500, 200]);
    let server = scripted_server(responder.clone()).await;

    let engine = start_engine(test_config());
    let webhook = Webhook::new("backoff", server.uri())
        .subscribe("task.completed")
        .with_max_retries(2)
        .with_retry_delay_ms(100);
    engine.registry.upsert(webhook).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);

    let attempts = engine.dispatcher.attempts(delivery.id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1].started_at - attempts[0].started_at;
    let second_gap = attempts[2].started_at - attempts[1].started_at;
    assert!(first_gap >= chrono::Duration::milliseconds(100), "first gap {first_gap}");
    assert!(second_gap >= chrono::Duration::milliseconds(200), "second gap {second_gap}");
}

#[tokio::test]
async fn retries_use_the_webhook_as_dispatched() {
    let responder = ScriptedResponder::new(&[500, 200]);
    let server = scripted_server(responder.clone()).await;

    let engine = start_engine(test_config());
    let webhook = Webhook::new("snapshot", server.uri())
        .subscribe("task.completed")
        .with_retry_delay_ms(300);
    engine.registry.upsert(webhook.clone()).await;

    let ids = engine
        .dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();
    wait_for_status(&*engine.store, ids[0], DeliveryStatus::Retrying).await;

    // Repoint and disable the webhook, then drop it from the registry.
    let mut changed = webhook.clone();
    changed.url = "http://127.0.0.1:1/".into();
    changed.enabled = false;
    engine.registry.upsert(changed).await;
    assert!(engine.registry.remove(webhook.id).await.is_some());

    let delivery = wait_for_terminal(&*engine.store, ids[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.retry_count, 1);
    assert_eq!(responder.calls(), 2);
}

#[tokio::test]
async fn retry_is_armed_once_retrying_state_is_stored() {
    let responder = ScriptedResponder::new(&[500, 200]);
    let server = scripted_server(responder.clone()).await;

    let store = Arc::new(FlakyStore::default());
    store.fail_retry_updates.store(true, Ordering::SeqCst);
    let registry = Arc::new(InMemoryWebhookRegistry::new());
    let webhook = Webhook::new("w", server.uri())
        .subscribe("task.completed")
        .with_max_retries(3)
        .with_retry_delay_ms(10);
    registry.upsert(webhook).await;

    let dispatcher = Dispatcher::new(test_config(), registry, store.clone()).unwrap();
    let ids = dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();

    // While the store rejects the write, the retry stays parked.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(responder.calls(), 1);
    let parked = store.inner.get_delivery(ids[0]).await.unwrap().unwrap();
    assert_eq!(parked.status, DeliveryStatus::Pending);

    store.fail_retry_updates.store(false, Ordering::SeqCst);

    let delivery = wait_for_terminal(&*store, ids[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.retry_count, 1);
    assert_eq!(responder.calls(), 2);
    assert_eq!(store.inner.attempts_for(ids[0]).await.unwrap().len(), 2);
}

#[tokio::test]
async fn terminal_state_is_written_once_store_recovers() {
    let responder = ScriptedResponder::always(200);
    let server = scripted_server(responder.clone()).await;

    let store = Arc::new(FlakyStore::default());
    store.fail_terminal_updates.store(true, Ordering::SeqCst);
    let registry = Arc::new(InMemoryWebhookRegistry::new());
    registry
        .upsert(Webhook::new("w", server.uri()).subscribe("task.completed"))
        .await;

    let dispatcher = Dispatcher::new(test_config(), registry, store.clone()).unwrap();
    let ids = dispatcher
        .dispatch(&Event::new("task.completed", json!({})))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let unwritten = store.inner.get_delivery(ids[0]).await.unwrap().unwrap();
    assert_eq!(unwritten.status, DeliveryStatus::Pending);

    store.fail_terminal_updates.store(false, Ordering::SeqCst);

    let delivery = wait_for_terminal(&*store, ids[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(responder.calls(), 1);
}
