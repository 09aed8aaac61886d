use anyhow::Context;
use foodlink_core::clock::SystemClock;
use foodlink_core::events::EventSink;
use foodlink_store::app_config::Config;
use foodlink_store::{DbClient, PostgresEntityStore};
use foodlink_worker::{start_background_workers, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foodlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting FoodLink worker");

    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(PostgresEntityStore::new(db.pool.clone()));

    let sink = event_sink(&config)?;
    let state = AppState::build(&config, store, sink, Arc::new(SystemClock))
        .context("Invalid business rules")?;

    let workers = start_background_workers(&state);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    workers.shutdown().await;
    Ok(())
}

#[cfg(feature = "kafka")]
fn event_sink(config: &Config) -> anyhow::Result<Arc<dyn EventSink>> {
    let producer = foodlink_store::KafkaEventSink::new(&config.kafka)
        .context("Failed to create Kafka producer")?;
    tracing::info!(brokers = %config.kafka.brokers, "Publishing events to Kafka");
    Ok(Arc::new(producer))
}

#[cfg(not(feature = "kafka"))]
fn event_sink(config: &Config) -> anyhow::Result<Arc<dyn EventSink>> {
    let mut sink = foodlink_store::BroadcastEventSink::new(config.relay.broadcast_capacity);
    if config.relay.require_subscribers {
        sink = sink.require_subscribers();
    }
    tracing::warn!("Built without the kafka feature, events stay in-process");
    Ok(Arc::new(sink))
}
