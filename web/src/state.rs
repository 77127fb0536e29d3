//! Shared application state for the two HTTP surfaces.

use catalog_core::command_bus::CommandBus;
use catalog_core::config::PipelineConfig;
use catalog_postgres::{CatalogStore, DeadLetterStore};
use std::sync::Arc;

/// State for the write edge: a command bus and the topic to publish to.
///
/// The edge never touches the database. Its only dependency is the log.
#[derive(Clone)]
pub struct EdgeState {
    /// The command bus publishes land on.
    pub bus: Arc<dyn CommandBus>,
    /// Topic carrying catalog commands.
    pub topic: String,
}

impl EdgeState {
    /// Create edge state from configuration and a bus.
    #[must_use]
    pub fn new(config: &PipelineConfig, bus: Arc<dyn CommandBus>) -> Self {
        Self {
            bus,
            topic: config.topic.clone(),
        }
    }
}

/// State for the worker's read API: the materialized stores.
#[derive(Clone)]
pub struct WorkerState {
    /// The materialized catalog table.
    pub store: CatalogStore,
    /// Failed-record store, surfaced for inspection.
    pub dead_letters: DeadLetterStore,
}

impl WorkerState {
    /// Create worker state over the two stores.
    #[must_use]
    pub const fn new(store: CatalogStore, dead_letters: DeadLetterStore) -> Self {
        Self {
            store,
            dead_letters,
        }
    }
}
