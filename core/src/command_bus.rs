//! Command bus abstraction over the partitioned append log.
//!
//! The [`CommandBus`] trait is the seam between the pipeline and the
//! broker. The write edge publishes commands through it; the worker
//! subscribes under a named consumer group and pulls raw records.
//!
//! # Delivery Semantics
//!
//! - **Publish** is acknowledged only after the broker confirms receipt;
//!   a failed acknowledgment surfaces synchronously to the caller and is
//!   not retried by the bus (single attempt per call).
//! - **Subscribe** is at-least-once within a consumer group: each record
//!   arrives as a [`CommandDelivery`] carrying a [`DeliveryAck`], and the
//!   transport commits the record's offset only after the loop fires the
//!   ack. A crash before the ack causes redelivery. The materializer is
//!   idempotent for CREATE (upsert on identity) to absorb duplicates.
//! - Records for the same business identity are keyed by that identity,
//!   so they land in one partition and arrive in publish order.
//!
//! # Raw Records
//!
//! Subscribers receive [`CommandRecord`]s, not decoded commands. Decode
//! happens inside the consumer loop so a malformed payload can be
//! dead-lettered with its raw bytes instead of being lost in transport.

use crate::command::Command;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during command bus operations.
#[derive(Error, Debug, Clone)]
pub enum CommandBusError {
    /// Failed to reach or configure the broker.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a command to a topic.
    #[error("publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to a topic under a consumer group.
    #[error("subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Network or transport error while consuming.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// One raw record as delivered by the broker.
///
/// The payload is the UTF-8 JSON command encoding; the key is the
/// partition key the producer stamped (the business identity, when the
/// command carried one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Raw record payload (UTF-8 JSON command object).
    pub payload: Vec<u8>,
    /// Partition key, if the record was keyed.
    pub key: Option<Vec<u8>>,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset of the record within its partition.
    pub offset: i64,
}

impl CommandRecord {
    /// The record key as UTF-8, when present and valid.
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// Broker acknowledgment for a published command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Partition the record landed on.
    pub partition: i32,
    /// Offset assigned to the record.
    pub offset: i64,
}

/// Acknowledgment for one delivered record.
///
/// The consumer loop acknowledges a record once it has been fully
/// processed (applied or dead-lettered); the transport commits the
/// record's offset only then, so the committed offset never runs ahead
/// of applied state. Dropping the handle without acknowledging leaves
/// the offset uncommitted and the record is redelivered.
#[derive(Debug)]
pub struct DeliveryAck {
    signal: Option<oneshot::Sender<()>>,
}

impl DeliveryAck {
    /// An ack wired to the transport's offset commit.
    #[must_use]
    pub fn tracked(signal: oneshot::Sender<()>) -> Self {
        Self {
            signal: Some(signal),
        }
    }

    /// A no-op ack, for transports without offset tracking.
    #[must_use]
    pub const fn untracked() -> Self {
        Self { signal: None }
    }

    /// Mark the record as processed.
    pub fn ack(mut self) {
        if let Some(signal) = self.signal.take() {
            // A transport that already went away has no offset left to
            // commit.
            let _ = signal.send(());
        }
    }
}

/// One record from a subscription, plus its acknowledgment handle.
#[derive(Debug)]
pub struct CommandDelivery {
    /// The raw record.
    pub record: CommandRecord,
    /// Acknowledgment the loop fires after processing the record.
    pub ack: DeliveryAck,
}

/// Stream of record deliveries from a subscription.
///
/// Each item is either a delivery or a transport-level error; transport
/// errors do not terminate the stream.
pub type CommandStream =
    Pin<Box<dyn Stream<Item = Result<CommandDelivery, CommandBusError>> + Send>>;

/// Trait for command bus implementations.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so
/// the bus can be held as a trait object (`Arc<dyn CommandBus>`) and
/// shared between the web edge and the consumer loop.
pub trait CommandBus: Send + Sync {
    /// Publish a command to a topic, keyed by its business identity.
    ///
    /// Resolves only once the broker acknowledges the record. A failed
    /// acknowledgment is surfaced to the caller; the bus performs no
    /// internal retry.
    ///
    /// # Errors
    ///
    /// Returns [`CommandBusError::PublishFailed`] if encoding or the
    /// broker acknowledgment fails.
    fn publish(
        &self,
        topic: &str,
        command: &Command,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, CommandBusError>> + Send + '_>>;

    /// Subscribe to a topic under a named consumer group.
    ///
    /// Returns a [`CommandStream`] of deliveries with at-least-once
    /// semantics: the transport commits a record's offset only after its
    /// [`DeliveryAck`] fires.
    ///
    /// # Errors
    ///
    /// Returns [`CommandBusError::SubscriptionFailed`] if the consumer
    /// cannot be created or the subscription is rejected.
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, CommandBusError>> + Send + '_>>;
}
