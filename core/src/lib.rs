//! # Catalog Core
//!
//! Core types for the catalog mutation pipeline.
//!
//! This crate defines the shared vocabulary of the pipeline:
//!
//! - **Command**: a single intended mutation (CREATE/UPDATE/DELETE) carried
//!   as one log record, together with its JSON wire codec
//! - **`CommandBus`**: the abstraction over the partitioned append log that
//!   carries commands from the write edge to the materializing worker
//! - **`PipelineConfig`**: the immutable configuration object constructed
//!   once at process start and passed by reference into each component
//!
//! ## Data Flow
//!
//! ```text
//! HTTP mutation request
//!        │
//!        ▼
//! ┌──────────────┐    publish     ┌─────────────────┐
//! │  Write edge  │───────────────▶│  Log (topic,    │
//! │  (Command)   │   keyed by     │   partitioned)  │
//! └──────────────┘   identity     └────────┬────────┘
//!                                          │ consume
//!                                          ▼
//!                                 ┌─────────────────┐
//!                                 │  Consumer loop  │
//!                                 │  decode→apply   │
//!                                 └────────┬────────┘
//!                                          ▼
//!                                 ┌─────────────────┐
//!                                 │  Catalog store  │◄── read API
//!                                 └─────────────────┘
//! ```
//!
//! Reads bypass the log entirely and query the catalog store directly;
//! the write path acknowledges once the broker has the record, not once
//! materialization completes.

pub mod command;
pub mod command_bus;
pub mod config;

pub use command::{CodecError, Command, Operation};
pub use command_bus::{
    CommandBus, CommandBusError, CommandDelivery, CommandRecord, CommandStream, DeliveryAck,
    PublishAck,
};
pub use config::{ConfigError, PipelineConfig, ProvisioningPolicy};
