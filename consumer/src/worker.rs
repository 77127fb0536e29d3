//! The consumer loop: subscribe, decode, dispatch, apply.
//!
//! One loop owns one subscription. Records are processed strictly in
//! stream order; a record that fails decode, dispatch or apply is routed
//! to the dead-letter sink and the loop moves on. Each delivery is
//! acknowledged only after processing completes, so the transport never
//! commits an offset ahead of applied state. Only transport-level
//! subscription failure degrades the loop itself.
//!
//! # Lifecycle
//!
//! ```text
//! Starting ──subscribe ok──▶ Running ──shutdown/stream end──▶ Stopping ──▶ Stopped
//!     │
//!     └──subscribe failed──▶ Degraded ──▶ Stopped
//! ```
//!
//! State is published over a [`watch`] channel so binaries and tests can
//! observe transitions without polling.

use crate::materializer::{ApplyError, Materializer};
use catalog_core::command::Command;
use catalog_core::command_bus::{CommandBus, CommandRecord};
use catalog_core::config::PipelineConfig;
use catalog_postgres::{DeadLetterStore, FailureStage, StoreError};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that stop the consumer loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The subscription could not be established.
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe {
        /// Topic the loop tried to consume.
        topic: String,
        /// Transport-level failure reason.
        reason: String,
    },
}

/// Observable lifecycle state of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created but not yet subscribed.
    Starting,
    /// Subscribed and processing records.
    Running,
    /// Subscription failed; the loop will not process records.
    Degraded,
    /// Shutdown observed; draining.
    Stopping,
    /// Fully stopped.
    Stopped,
}

/// Applies a decoded command. Implemented by [`Materializer`]; tests
/// substitute recorders.
pub trait CommandApplier: Send + Sync {
    /// Apply one command.
    fn apply<'a>(
        &'a self,
        command: &'a Command,
    ) -> Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>>;
}

impl CommandApplier for Materializer {
    fn apply<'a>(
        &'a self,
        command: &'a Command,
    ) -> Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>> {
        Box::pin(Self::apply(self, command))
    }
}

/// Receives records the loop could not process.
pub trait DeadLetterSink: Send + Sync {
    /// Record a failed payload with its failure stage and reason.
    fn record<'a>(
        &'a self,
        stage: FailureStage,
        raw_payload: &'a [u8],
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>>;
}

impl DeadLetterSink for DeadLetterStore {
    fn record<'a>(
        &'a self,
        stage: FailureStage,
        raw_payload: &'a [u8],
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>> {
        Box::pin(Self::record(self, stage, raw_payload, reason))
    }
}

/// Handle for observing and stopping a running [`ConsumerLoop`].
#[derive(Clone)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LoopState>,
}

impl ConsumerHandle {
    /// Signal the loop to stop after the record in flight.
    pub fn shutdown(&self) {
        // An error means the loop is already gone, which is fine.
        let _ = self.shutdown.send(true);
    }

    /// The loop's current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Wait until the loop reaches `target`.
    pub async fn wait_for(&self, target: LoopState) {
        let mut rx = self.state.clone();
        while *rx.borrow_and_update() != target {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A single-subscription consumer loop.
pub struct ConsumerLoop {
    bus: Arc<dyn CommandBus>,
    applier: Arc<dyn CommandApplier>,
    dead_letters: Arc<dyn DeadLetterSink>,
    topic: String,
    group: String,
    state: watch::Sender<LoopState>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerLoop {
    /// Create a loop and its control handle.
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        bus: Arc<dyn CommandBus>,
        applier: Arc<dyn CommandApplier>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> (Self, ConsumerHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LoopState::Starting);

        let handle = ConsumerHandle {
            shutdown: shutdown_tx,
            state: state_rx,
        };

        let consumer = Self {
            bus,
            applier,
            dead_letters,
            topic: config.topic.clone(),
            group: config.consumer_group.clone(),
            state: state_tx,
            shutdown: shutdown_rx,
        };

        (consumer, handle)
    }

    /// Run until shutdown or the stream ends.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Subscribe`] when the subscription cannot
    /// be established; the loop transitions through `Degraded` to
    /// `Stopped` before returning.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        tracing::info!(topic = %self.topic, group = %self.group, "Consumer starting");

        let mut stream = match self.bus.subscribe(&self.topic, &self.group).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(topic = %self.topic, error = %e, "Subscription failed");
                self.set_state(LoopState::Degraded);
                self.set_state(LoopState::Stopped);
                return Err(ConsumerError::Subscribe {
                    topic: self.topic,
                    reason: e.to_string(),
                });
            }
        };

        self.set_state(LoopState::Running);
        tracing::info!(topic = %self.topic, "Consumer running");

        while !*self.shutdown.borrow() {
            tokio::select! {
                delivery = stream.next() => match delivery {
                    Some(Ok(delivery)) => {
                        self.process_record(&delivery.record).await;
                        // The ack gates the transport's offset commit: a
                        // record is committed only once applied or
                        // dead-lettered, never while still in flight.
                        delivery.ack.ack();
                    }
                    Some(Err(e)) => {
                        // Transport hiccup on one poll; the subscription
                        // itself is still live.
                        tracing::error!(topic = %self.topic, error = %e, "Transport error");
                    }
                    None => {
                        tracing::info!(topic = %self.topic, "Stream ended");
                        break;
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(LoopState::Stopping);
        tracing::info!(topic = %self.topic, "Consumer stopping");
        drop(stream);
        self.set_state(LoopState::Stopped);
        tracing::info!(topic = %self.topic, "Consumer stopped");

        Ok(())
    }

    /// Decode, dispatch and apply one record. Failures are dead-lettered;
    /// nothing here stops the loop.
    async fn process_record(&self, record: &CommandRecord) {
        let command = match Command::decode(&record.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    partition = record.partition,
                    offset = record.offset,
                    payload = %String::from_utf8_lossy(&record.payload),
                    error = %e,
                    "Record failed to decode"
                );
                self.dead_letter(FailureStage::Decode, &record.payload, &e.to_string())
                    .await;
                return;
            }
        };

        if !command.operation.is_recognized() {
            tracing::warn!(
                partition = record.partition,
                offset = record.offset,
                operation = %command.operation,
                "Unrecognized operation"
            );
            self.dead_letter(
                FailureStage::Dispatch,
                &record.payload,
                &format!("unrecognized operation: {}", command.operation),
            )
            .await;
            return;
        }

        if let Err(e) = self.applier.apply(&command).await {
            tracing::warn!(
                partition = record.partition,
                offset = record.offset,
                operation = %command.operation,
                error = %e,
                "Command failed to apply"
            );
            self.dead_letter(FailureStage::Apply, &record.payload, &e.to_string())
                .await;
            return;
        }

        metrics::counter!("catalog.records.processed").increment(1);
    }

    async fn dead_letter(&self, stage: FailureStage, payload: &[u8], reason: &str) {
        metrics::counter!("catalog.records.failed", "stage" => stage.as_str()).increment(1);

        // A failing sink must not stop the loop; the failure is already
        // in the log above.
        if let Err(e) = self.dead_letters.record(stage, payload, reason).await {
            tracing::error!(error = %e, "Failed to record dead letter");
        }
    }

    fn set_state(&self, state: LoopState) {
        let _ = self.state.send(state);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use catalog_core::command_bus::{
        CommandBusError, CommandDelivery, CommandStream, DeliveryAck, PublishAck,
    };
    use catalog_testing::InMemoryCommandBus;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{Notify, oneshot};

    /// Records every command it is asked to apply; can be primed to fail.
    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<Command>>,
        fail_next: Mutex<bool>,
    }

    impl RecordingApplier {
        fn applied(&self) -> Vec<Command> {
            self.applied.lock().unwrap().clone()
        }

        fn fail_next(&self) {
            *self.fail_next.lock().unwrap() = true;
        }
    }

    impl CommandApplier for RecordingApplier {
        fn apply<'a>(
            &'a self,
            command: &'a Command,
        ) -> Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>> {
            Box::pin(async move {
                if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                    return Err(ApplyError::Store(StoreError::Database(
                        "primed failure".to_string(),
                    )));
                }
                self.applied.lock().unwrap().push(command.clone());
                Ok(())
            })
        }
    }

    /// Collects dead letters in memory.
    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<(FailureStage, Vec<u8>, String)>>,
    }

    impl RecordingSink {
        fn entries(&self) -> Vec<(FailureStage, Vec<u8>, String)> {
            self.entries.lock().unwrap().clone()
        }
    }

    impl DeadLetterSink for RecordingSink {
        fn record<'a>(
            &'a self,
            stage: FailureStage,
            raw_payload: &'a [u8],
            reason: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + 'a>> {
            Box::pin(async move {
                let mut entries = self.entries.lock().unwrap();
                entries.push((stage, raw_payload.to_vec(), reason.to_string()));
                #[allow(clippy::cast_possible_wrap)]
                let id = entries.len() as i64;
                Ok(id)
            })
        }
    }

    fn harness() -> (
        InMemoryCommandBus,
        Arc<RecordingApplier>,
        Arc<RecordingSink>,
        ConsumerLoop,
        ConsumerHandle,
    ) {
        let config = PipelineConfig::default();
        let bus = InMemoryCommandBus::new();
        let applier = Arc::new(RecordingApplier::default());
        let sink = Arc::new(RecordingSink::default());

        let (consumer, handle) = ConsumerLoop::new(
            &config,
            Arc::new(bus.clone()),
            applier.clone(),
            sink.clone(),
        );

        (bus, applier, sink, consumer, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn applies_valid_commands_in_order() {
        let (bus, applier, sink, consumer, handle) = harness();
        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;

        bus.publish("catalog-commands", &Command::create("p1", "Widget", "d", 9.99, "tools"))
            .await
            .unwrap();
        bus.publish("catalog-commands", &Command::delete(1)).await.unwrap();
        settle().await;

        let applied = applier.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].product_id.as_deref(), Some("p1"));
        assert_eq!(applied[1].id, Some(1));
        assert!(sink.entries().is_empty());

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_and_the_loop_continues() {
        let (bus, applier, sink, consumer, handle) = harness();
        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;

        bus.publish_raw("catalog-commands", b"not json".to_vec(), None).await;
        bus.publish("catalog-commands", &Command::create("p2", "Gadget", "d", 1.0, "tools"))
            .await
            .unwrap();
        settle().await;

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, FailureStage::Decode);
        assert_eq!(entries[0].1, b"not json");

        // The record after the failure was still applied.
        assert_eq!(applier.applied().len(), 1);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unrecognized_operation_is_dead_lettered_at_dispatch() {
        let (bus, applier, sink, consumer, handle) = harness();
        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;

        bus.publish_raw(
            "catalog-commands",
            br#"{"operation":"FROBNICATE","id":1}"#.to_vec(),
            None,
        )
        .await;
        settle().await;

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, FailureStage::Dispatch);
        assert!(entries[0].2.contains("FROBNICATE"));
        assert!(applier.applied().is_empty());

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn apply_failure_is_isolated_to_its_record() {
        let (bus, applier, sink, consumer, handle) = harness();
        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;

        applier.fail_next();
        bus.publish("catalog-commands", &Command::delete(1)).await.unwrap();
        bus.publish("catalog-commands", &Command::delete(2)).await.unwrap();
        settle().await;

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, FailureStage::Apply);
        assert_eq!(applier.applied().len(), 1);
        assert_eq!(applier.applied()[0].id, Some(2));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    /// Serves exactly one pre-built delivery, then ends the stream.
    struct SingleDeliveryBus {
        delivery: Mutex<Option<CommandDelivery>>,
    }

    impl CommandBus for SingleDeliveryBus {
        fn publish(
            &self,
            topic: &str,
            _command: &Command,
        ) -> Pin<Box<dyn Future<Output = Result<PublishAck, CommandBusError>> + Send + '_>>
        {
            let topic = topic.to_string();
            Box::pin(async move {
                Err(CommandBusError::PublishFailed {
                    topic,
                    reason: "subscribe-only test double".to_string(),
                })
            })
        }

        fn subscribe(
            &self,
            _topic: &str,
            _group: &str,
        ) -> Pin<Box<dyn Future<Output = Result<CommandStream, CommandBusError>> + Send + '_>>
        {
            let delivery = self.delivery.lock().unwrap().take();
            Box::pin(async move {
                let items: Vec<Result<CommandDelivery, CommandBusError>> =
                    delivery.into_iter().map(Ok).collect();
                Ok(Box::pin(futures::stream::iter(items)) as CommandStream)
            })
        }
    }

    /// Holds every apply until released.
    struct GatedApplier {
        release: Arc<Notify>,
    }

    impl CommandApplier for GatedApplier {
        fn apply<'a>(
            &'a self,
            _command: &'a Command,
        ) -> Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>> {
            Box::pin(async move {
                self.release.notified().await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn delivery_is_acknowledged_only_after_processing_completes() {
        let (ack_tx, mut ack_rx) = oneshot::channel();
        let command = Command::delete(1);
        let bus = SingleDeliveryBus {
            delivery: Mutex::new(Some(CommandDelivery {
                record: CommandRecord {
                    payload: command.encode().unwrap(),
                    key: None,
                    partition: 0,
                    offset: 0,
                },
                ack: DeliveryAck::tracked(ack_tx),
            })),
        };
        let release = Arc::new(Notify::new());
        let applier = Arc::new(GatedApplier {
            release: release.clone(),
        });
        let sink = Arc::new(RecordingSink::default());

        let (consumer, handle) = ConsumerLoop::new(
            &PipelineConfig::default(),
            Arc::new(bus),
            applier,
            sink,
        );
        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;
        settle().await;

        // Mid-apply: the offset commit must still be withheld.
        assert!(matches!(
            ack_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), &mut ack_rx)
            .await
            .expect("ack should arrive once the apply finishes")
            .expect("ack channel should not close unfired");

        // The stream ends after its single record; the loop drains out.
        handle.wait_for(LoopState::Stopped).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_walks_the_state_machine() {
        let (_bus, _applier, _sink, consumer, handle) = harness();
        assert_eq!(handle.state(), LoopState::Starting);

        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;

        handle.shutdown();
        handle.wait_for(LoopState::Stopped).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscription_failure_degrades_then_stops() {
        let (bus, _applier, _sink, consumer, handle) = harness();
        bus.fail_subscriptions("broker down");

        let result = consumer.run().await;
        assert!(matches!(result, Err(ConsumerError::Subscribe { .. })));
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn stream_end_stops_the_loop() {
        let (bus, _applier, _sink, consumer, handle) = harness();
        let task = tokio::spawn(consumer.run());
        handle.wait_for(LoopState::Running).await;

        bus.disconnect();
        handle.wait_for(LoopState::Stopped).await;
        task.await.unwrap().unwrap();
    }
}
