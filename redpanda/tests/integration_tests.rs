//! Integration tests for [`RedpandaCommandBus`] against a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/consume round-trip of the JSON command encoding
//! - Identity keying of published records
//! - Topic provisioning against a reachable broker
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` by default because they require Docker and take
//! tens of seconds per test to spin up Kafka:
//!
//! ```bash
//! cargo test -p catalog-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use catalog_core::{Command, CommandBus, PipelineConfig};
use catalog_redpanda::{RedpandaCommandBus, TopicProvisioner};
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (testcontainers::ContainerAsync<Kafka>, String) {
    let container = Kafka::default()
        .start()
        .await
        .expect("kafka container should start");
    let port = container
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("mapped port should resolve");
    (container, format!("127.0.0.1:{port}"))
}

/// Wait until the broker accepts a publish.
async fn wait_for_broker(bus: &RedpandaCommandBus, topic: &str) {
    let warmup = Command::create("warmup", "w", "w", 0.0, "w");
    for attempt in 1..=60 {
        if bus.publish(topic, &warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt < 60, "broker failed to become ready");
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publish_consume_round_trip_preserves_command() {
    let (_container, brokers) = start_kafka().await;
    let topic = "it-round-trip";

    let bus = RedpandaCommandBus::builder()
        .brokers(&brokers)
        .auto_offset_reset("earliest")
        .build()
        .expect("bus should build");
    wait_for_broker(&bus, topic).await;

    let command = Command::create("p1", "Widget", "d", 9.99, "tools");
    let ack = bus.publish(topic, &command).await.expect("publish should ack");
    assert!(ack.offset >= 0);

    let mut stream = bus
        .subscribe(topic, "it-round-trip-group")
        .await
        .expect("subscribe should succeed");

    let record = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match stream.next().await {
                Some(Ok(delivery)) => {
                    let record = delivery.record;
                    delivery.ack.ack();
                    // Skip the warmup record.
                    if record.key_str() == Some("p1") {
                        return record;
                    }
                }
                Some(Err(_)) => {}
                None => panic!("stream ended unexpectedly"),
            }
        }
    })
    .await
    .expect("record should arrive");

    assert_eq!(record.key_str(), Some("p1"));
    let decoded = Command::decode(&record.payload).expect("payload should decode");
    assert_eq!(decoded, command);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn provisioner_succeeds_against_reachable_broker() {
    let (_container, brokers) = start_kafka().await;

    let config = PipelineConfig::default().with_brokers(&brokers);
    let provisioner = TopicProvisioner::new(&config);

    provisioner
        .ensure_topic("it-provisioned")
        .await
        .expect("provisioning should succeed");

    // Second run must also succeed: already-exists is not an error.
    provisioner
        .ensure_topic("it-provisioned")
        .await
        .expect("re-provisioning should be idempotent");
}
