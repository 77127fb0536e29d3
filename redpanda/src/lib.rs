//! Redpanda/Kafka command bus for the catalog pipeline.
//!
//! This crate provides the production [`CommandBus`] implementation on top
//! of rdkafka, plus the startup [`TopicProvisioner`]. It works against any
//! Kafka-compatible broker (Redpanda, Apache Kafka, managed offerings).
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the consumer loop acknowledges a record
//!   as processed; a crash before the ack causes redelivery, and the
//!   committed offset never runs ahead of applied state
//! - Records are keyed by the command's business identity, so commands for
//!   the same catalog item land on one partition and stay ordered
//! - Publishing resolves only after the broker acknowledges the record;
//!   a failed ack surfaces to the caller and is not retried here
//!
//! # Example
//!
//! ```no_run
//! use catalog_core::{Command, CommandBus};
//! use catalog_redpanda::RedpandaCommandBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaCommandBus::new("localhost:9092")?;
//!
//! let command = Command::create("p1", "Widget", "d", 9.99, "tools");
//! let ack = bus.publish("catalog-commands", &command).await?;
//! println!("landed on partition {} at offset {}", ack.partition, ack.offset);
//! # Ok(())
//! # }
//! ```

pub mod provisioner;

pub use provisioner::{ProvisionError, TopicProvisioner};

use catalog_core::command::Command;
use catalog_core::command_bus::{
    CommandBus, CommandBusError, CommandDelivery, CommandRecord, CommandStream, DeliveryAck,
    PublishAck,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Kafka-compatible command bus.
///
/// Holds a single shared producer; each subscription creates its own
/// consumer owned by a forwarding task, so the underlying connection is
/// released exactly once when the stream is dropped.
pub struct RedpandaCommandBus {
    /// Producer for publishing commands.
    producer: FutureProducer,
    /// Broker addresses (for creating consumers).
    brokers: String,
    /// Producer ack timeout.
    timeout: Duration,
    /// Record buffer between the consumer task and the loop.
    buffer_size: usize,
    /// Where new consumer groups start reading.
    auto_offset_reset: String,
}

impl RedpandaCommandBus {
    /// Create a command bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CommandBusError::ConnectionFailed`] if the producer
    /// cannot be created from the given broker list.
    pub fn new(brokers: &str) -> Result<Self, CommandBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RedpandaCommandBusBuilder {
        RedpandaCommandBusBuilder::default()
    }

    /// The configured broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for a [`RedpandaCommandBus`].
#[derive(Default)]
pub struct RedpandaCommandBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaCommandBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the producer ack timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the record buffer size between the consumer and the loop.
    ///
    /// Default: 1000.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set where new consumer groups start reading: "earliest", "latest"
    /// or "error".
    ///
    /// Default: "latest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaCommandBus`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandBusError::ConnectionFailed`] if brokers are not
    /// set or the producer cannot be created.
    pub fn build(self) -> Result<RedpandaCommandBus, CommandBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| CommandBusError::ConnectionFailed("brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"));

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            CommandBusError::ConnectionFailed(format!("failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "Redpanda command bus created"
        );

        Ok(RedpandaCommandBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
        })
    }
}

impl CommandBus for RedpandaCommandBus {
    fn publish(
        &self,
        topic: &str,
        command: &Command,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, CommandBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let command = command.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = command
                .encode()
                .map_err(|e| CommandBusError::PublishFailed {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })?;

            // Key by business identity so same-identity commands share a
            // partition and arrive in publish order. A command without an
            // identity publishes unkeyed.
            let key = command.partition_key().map(str::to_owned);

            let send_result = match key.as_deref() {
                Some(k) => {
                    let record = FutureRecord::to(&topic).payload(&payload).key(k);
                    self.producer.send(record, Timeout::After(timeout)).await
                }
                None => {
                    let record = FutureRecord::<(), _>::to(&topic).payload(&payload);
                    self.producer.send(record, Timeout::After(timeout)).await
                }
            };

            match send_result {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        operation = %command.operation,
                        key = key.as_deref().unwrap_or(""),
                        "Command published"
                    );
                    metrics::counter!("catalog.commands.published").increment(1);
                    Ok(PublishAck { partition, offset })
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        operation = %command.operation,
                        error = %kafka_error,
                        "Failed to publish command"
                    );
                    metrics::counter!("catalog.commands.publish_failed").increment(1);
                    Err(CommandBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, CommandBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            // Manual commit: the offset is committed only after the loop
            // acknowledges the record as processed (at-least-once).
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| CommandBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| CommandBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                consumer_group = %group,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to command topic"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The spawned task owns the consumer; dropping the stream drops
            // the receiver, which ends the task and releases the connection
            // exactly once.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(message) => {
                            // An absent payload becomes an empty one: the
                            // loop's decode step fails it and dead-letters
                            // the record instead of losing it in transport.
                            let record = CommandRecord {
                                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                                key: message.key().map(<[u8]>::to_vec),
                                partition: message.partition(),
                                offset: message.offset(),
                            };

                            tracing::trace!(
                                partition = record.partition,
                                offset = record.offset,
                                bytes = record.payload.len(),
                                "Received record"
                            );

                            let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                            let delivery = CommandDelivery {
                                record,
                                ack: DeliveryAck::tracked(ack_tx),
                            };

                            if tx.send(Ok(delivery)).await.is_err() {
                                tracing::debug!("Record receiver dropped, exiting consumer task");
                                break; // exit WITHOUT committing
                            }

                            // Wait for the loop to finish with the record.
                            // A handle dropped unacknowledged means the
                            // stream went away mid-record; the offset stays
                            // uncommitted so the record is redelivered.
                            if ack_rx.await.is_err() {
                                tracing::debug!(
                                    "Record dropped unacknowledged, exiting consumer task"
                                );
                                break;
                            }

                            // Commit AFTER processing. A failed commit only
                            // means possible redelivery.
                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (record may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err =
                                CommandBusError::TransportError(format!("receive failed: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

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
