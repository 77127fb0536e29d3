//! Postgres storage for the catalog pipeline.
//!
//! Two stores share one database:
//!
//! - [`CatalogStore`]: the materialized catalog table. The materializer is
//!   its only writer; the read API queries it directly, bypassing the log.
//! - [`DeadLetterStore`]: the side channel for records that failed decode,
//!   dispatch or apply, kept with their raw payload and failure reason for
//!   later inspection and replay.
//!
//! Both stores bootstrap their own tables at startup (`CREATE TABLE IF
//! NOT EXISTS`); full migration tooling is deliberately out of scope.

pub mod dead_letter;
pub mod store;

pub use dead_letter::{DeadLetter, DeadLetterStatus, DeadLetterStore, FailureStage};
pub use store::{CatalogItem, CatalogStore, ItemFields};

use thiserror::Error;

/// Errors from catalog or dead-letter storage.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(String),
}
