//! # Catalog Consumer
//!
//! The worker side of the catalog pipeline: a [`ConsumerLoop`] subscribes
//! to the command topic, decodes each record, and hands recognized
//! commands to the [`Materializer`], which applies them to the catalog
//! table one transaction per record.
//!
//! Per-record failures never stop the loop: a record that fails decode,
//! dispatch or apply is routed to the dead-letter store and processing
//! continues with the next record. Only a failed subscription degrades
//! the loop itself.

pub mod materializer;
pub mod worker;

pub use materializer::{ApplyError, Materializer};
pub use worker::{
    CommandApplier, ConsumerError, ConsumerHandle, ConsumerLoop, DeadLetterSink, LoopState,
};
