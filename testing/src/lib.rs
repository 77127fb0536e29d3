//! # Catalog Testing
//!
//! Testing utilities for the catalog pipeline.
//!
//! The main tool here is [`InMemoryCommandBus`]: a [`CommandBus`] that
//! captures published commands and replays them to subscribers over a
//! channel, so the consumer loop and the write edge can be exercised at
//! memory speed without a broker.
//!
//! ## Example
//!
//! ```
//! use catalog_core::{Command, CommandBus};
//! use catalog_testing::InMemoryCommandBus;
//! use futures::StreamExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryCommandBus::new();
//! let mut stream = bus.subscribe("catalog-commands", "test-group").await?;
//!
//! bus.publish("catalog-commands", &Command::create("p1", "Widget", "d", 9.99, "tools"))
//!     .await?;
//!
//! let delivery = stream.next().await.transpose()?.ok_or("stream ended")?;
//! assert_eq!(delivery.record.key_str(), Some("p1"));
//! # Ok(())
//! # }
//! ```

use catalog_core::command::Command;
use catalog_core::command_bus::{
    CommandBus, CommandBusError, CommandDelivery, CommandRecord, CommandStream, DeliveryAck,
    PublishAck,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Subscriber = (String, mpsc::Sender<Result<CommandDelivery, CommandBusError>>);

/// In-memory command bus for tests.
///
/// Behaves like a single-partition broker: records are delivered to every
/// matching subscription in publish order, with monotonically increasing
/// offsets. Published records are additionally captured for assertions.
///
/// Failure injection:
/// - [`fail_subscriptions`](Self::fail_subscriptions) makes subsequent
///   `subscribe` calls fail, for exercising degraded startup paths
/// - [`publish_raw`](Self::publish_raw) injects arbitrary payloads
///   (malformed JSON, unknown operations) past the typed publish API
/// - [`disconnect`](Self::disconnect) ends all live streams, simulating
///   the broker hanging up
#[derive(Clone, Default)]
pub struct InMemoryCommandBus {
    published: Arc<Mutex<Vec<(String, CommandRecord)>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_offset: Arc<AtomicI64>,
    subscribe_failure: Arc<Mutex<Option<String>>>,
}

impl InMemoryCommandBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records published so far to `topic`, in publish order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only code).
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn published(&self, topic: &str) -> Vec<CommandRecord> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Make all subsequent `subscribe` calls fail with the given reason.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only code).
    #[allow(clippy::unwrap_used)]
    pub fn fail_subscriptions(&self, reason: &str) {
        *self.subscribe_failure.lock().unwrap() = Some(reason.to_string());
    }

    /// Deliver a raw payload to subscribers of `topic`, bypassing the
    /// typed publish path. Used to inject malformed records.
    #[allow(clippy::missing_panics_doc)] // lock poisoning is test-only
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>, key: Option<Vec<u8>>) {
        let record = CommandRecord {
            payload,
            key,
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        };
        self.deliver(topic, record).await;
    }

    /// Drop every live subscription, ending their streams.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only code).
    #[allow(clippy::unwrap_used)]
    pub fn disconnect(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    #[allow(clippy::unwrap_used)]
    async fn deliver(&self, topic: &str, record: CommandRecord) {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), record.clone()));

        // Clone senders out of the lock before awaiting on them.
        let targets: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, tx)| tx.clone())
            .collect();

        for tx in targets {
            // No offsets to track here, so deliveries carry no-op acks.
            let delivery = CommandDelivery {
                record: record.clone(),
                ack: DeliveryAck::untracked(),
            };
            // A dropped receiver just means that subscriber went away.
            let _ = tx.send(Ok(delivery)).await;
        }
    }
}

impl CommandBus for InMemoryCommandBus {
    fn publish(
        &self,
        topic: &str,
        command: &Command,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, CommandBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let command = command.clone();

        Box::pin(async move {
            let payload = command
                .encode()
                .map_err(|e| CommandBusError::PublishFailed {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })?;

            let record = CommandRecord {
                payload,
                key: command.partition_key().map(|k| k.as_bytes().to_vec()),
                partition: 0,
                offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
            };
            let offset = record.offset;

            self.deliver(&topic, record).await;

            Ok(PublishAck {
                partition: 0,
                offset,
            })
        })
    }

    #[allow(clippy::unwrap_used)]
    fn subscribe(
        &self,
        topic: &str,
        _group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, CommandBusError>> + Send + '_>> {
        let topic = topic.to_string();

        Box::pin(async move {
            if let Some(reason) = self.subscribe_failure.lock().unwrap().clone() {
                return Err(CommandBusError::SubscriptionFailed { topic, reason });
            }

            let (tx, rx) = mpsc::channel(128);
            self.subscribers.lock().unwrap().push((topic, tx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as CommandStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn captures_published_records() {
        let bus = InMemoryCommandBus::new();
        let command = Command::create("p1", "Widget", "d", 9.99, "tools");

        let ack = bus.publish("t", &command).await.expect("publish should succeed");
        assert_eq!(ack.offset, 0);

        let published = bus.published("t");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key_str(), Some("p1"));
        assert_eq!(Command::decode(&published[0].payload).unwrap(), command);
        assert!(bus.published("other").is_empty());
    }

    #[tokio::test]
    async fn delivers_to_subscribers_in_order() {
        let bus = InMemoryCommandBus::new();
        let mut stream = bus.subscribe("t", "g").await.expect("subscribe");

        bus.publish("t", &Command::create("p1", "A", "d", 1.0, "c")).await.unwrap();
        bus.publish("t", &Command::create("p2", "B", "d", 2.0, "c")).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.record.offset, 0);
        assert_eq!(second.record.offset, 1);
        assert_eq!(first.record.key_str(), Some("p1"));
        assert_eq!(second.record.key_str(), Some("p2"));
    }

    #[tokio::test]
    async fn subscription_failure_is_injectable() {
        let bus = InMemoryCommandBus::new();
        bus.fail_subscriptions("broker down");

        assert!(matches!(
            bus.subscribe("t", "g").await,
            Err(CommandBusError::SubscriptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_ends_streams() {
        let bus = InMemoryCommandBus::new();
        let mut stream = bus.subscribe("t", "g").await.expect("subscribe");

        bus.disconnect();
        assert!(stream.next().await.is_none());
    }
}
