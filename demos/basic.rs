use std::sync::Arc;

use serde::Serialize;
use tracing_subscriber::EnvFilter;
use webhook_engine::{
    Dispatcher, EngineConfig, Event, InMemoryDeliveryStore, InMemoryWebhookRegistry, Webhook,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskCompleted {
    task_id: u64,
    assignee: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webhook_delivery=info")))
        .init();

    let registry = Arc::new(InMemoryWebhookRegistry::new());
    let store = Arc::new(InMemoryDeliveryStore::new());

    let webhook = Webhook::new("orders", "https://example.com/webhook")
        .subscribe("task.completed")
        .with_secret("supersecret")
        .with_header("X-Tenant", "tenant_a")
        .with_max_retries(2);
    registry.upsert(webhook.clone()).await;

    let mut dispatcher = Dispatcher::new(EngineConfig::from_env()?, registry, store.clone())?;

    let event = Event::new(
        "task.completed",
        TaskCompleted {
            task_id: 123,
            assignee: "ada".to_string(),
        },
    );
    let ids = dispatcher.dispatch(&event).await?;
    println!("created {} deliveries", ids.len());

    dispatcher.shutdown().await;

    for delivery in store.all_deliveries().await {
        println!(
            "{} -> {} (retries: {}, error: {:?})",
            delivery.id,
            delivery.status.as_str(),
            delivery.retry_count,
            delivery.error_message
        );
    }
    println!("{:?}", dispatcher.webhook_health(webhook.id).await?);

    Ok(())
}
