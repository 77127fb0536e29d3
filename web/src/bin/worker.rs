//! The worker: runs the consumer loop that materializes commands into
//! the catalog table, and serves the read API over the result.
//!
//! Provisioning failure is not fatal here: the topic normally already
//! exists (the edge provisions it), and the subscription itself will
//! surface a broker that is truly unreachable.

use anyhow::{Context, Result};
use catalog_consumer::{ConsumerLoop, LoopState, Materializer};
use catalog_core::config::PipelineConfig;
use catalog_postgres::{CatalogStore, DeadLetterStore};
use catalog_redpanda::{RedpandaCommandBus, TopicProvisioner};
use catalog_web::{WorkerState, worker_router};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PipelineConfig::from_env().context("failed to load configuration")?;
    tracing::info!(
        brokers = %config.brokers,
        topic = %config.topic,
        group = %config.consumer_group,
        "Worker starting"
    );

    if let Err(e) = TopicProvisioner::new(&config).ensure_topic(&config.topic).await {
        tracing::warn!(error = %e, "Topic provisioning failed, continuing");
    }

    let store = CatalogStore::connect(&config.database_url)
        .await
        .context("failed to connect to the catalog database")?;
    store.bootstrap().await.context("failed to bootstrap catalog table")?;

    let dead_letters = DeadLetterStore::new(store.pool().clone());
    dead_letters
        .bootstrap()
        .await
        .context("failed to bootstrap dead-letter table")?;

    let bus = RedpandaCommandBus::builder()
        .brokers(&config.brokers)
        .auto_offset_reset("earliest")
        .build()
        .context("failed to build command bus")?;

    let (consumer, handle) = ConsumerLoop::new(
        &config,
        Arc::new(bus),
        Arc::new(Materializer::new(store.clone())),
        Arc::new(dead_letters.clone()),
    );
    let consumer_task = tokio::spawn(consumer.run());

    let state = WorkerState::new(store, dead_letters);
    let app = worker_router(state);

    let listener = tokio::net::TcpListener::bind(&config.worker_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.worker_addr))?;
    tracing::info!(addr = %config.worker_addr, "Read API listening");

    let shutdown_handle = handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_handle.shutdown();
        })
        .await
        .context("server error")?;

    handle.wait_for(LoopState::Stopped).await;
    match consumer_task.await {
        Ok(Ok(())) => tracing::info!("Consumer stopped cleanly"),
        Ok(Err(e)) => tracing::error!(error = %e, "Consumer stopped with error"),
        Err(e) => tracing::error!(error = %e, "Consumer task panicked"),
    }

    tracing::info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
