//! The write edge: accepts product mutations over HTTP and publishes
//! them as commands onto the log.
//!
//! Topic provisioning must succeed before the edge serves traffic; an
//! edge that cannot reach the broker would answer 502 to every request,
//! so exhausting the provisioning retries here is fatal.

use anyhow::{Context, Result};
use catalog_core::config::PipelineConfig;
use catalog_redpanda::{RedpandaCommandBus, TopicProvisioner};
use catalog_web::{EdgeState, edge_router};
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
    tracing::info!(brokers = %config.brokers, topic = %config.topic, "Edge starting");

    TopicProvisioner::new(&config)
        .ensure_topic(&config.topic)
        .await
        .context("topic provisioning failed, refusing to serve")?;

    let bus = RedpandaCommandBus::builder()
        .brokers(&config.brokers)
        .build()
        .context("failed to build command bus")?;

    let state = EdgeState::new(&config, Arc::new(bus));
    let app = edge_router(state);

    let listener = tokio::net::TcpListener::bind(&config.edge_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.edge_addr))?;
    tracing::info!(addr = %config.edge_addr, "Edge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Edge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
