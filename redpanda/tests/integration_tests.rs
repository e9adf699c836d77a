//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! Marked `#[ignore]`: they need Docker and take a while to start Kafka.
//!
//! ```bash
//! cargo test -p wattwise-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use wattwise_core::event::{DomainEvent, EntityType, EventKind};
use wattwise_core::event_bus::{DeliveryStream, EventBus};
use wattwise_redpanda::RedpandaEventBus;

async fn start_kafka() -> (ContainerAsync<Kafka>, RedpandaEventBus) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");

    let bus = RedpandaEventBus::builder()
        .brokers(format!("{host}:{port}"))
        .group_prefix("it-")
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create event bus");

    // Wait until the broker accepts writes; this also creates the topic.
    for attempt in 1..=60 {
        if bus.publish("warmup", "0", b"{}").await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(attempt != 60, "Kafka did not become ready");
    }
    (kafka, bus)
}

fn goal_event(goal_id: i64, sequence: u64) -> Vec<u8> {
    DomainEvent::from_snapshot(
        EntityType::Goal,
        goal_id,
        EventKind::Updated,
        sequence,
        &serde_json::json!({ "id": goal_id }),
        chrono::Utc::now(),
    )
    .unwrap()
    .to_json_bytes()
    .unwrap()
}

async fn next_sequence(stream: &mut DeliveryStream) -> (u64, wattwise_core::event_bus::Delivery) {
    let delivery = tokio::time::timeout(Duration::from_secs(20), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
        .expect("Transport error");
    let event = DomainEvent::from_json_bytes(&delivery.message().payload).unwrap();
    (event.sequence, delivery)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn keyed_messages_arrive_in_order() {
    let (_kafka, bus) = start_kafka().await;
    for sequence in 1..=3 {
        bus.publish("goal", "7", &goal_event(7, sequence)).await.unwrap();
    }

    let mut stream = bus.subscribe("ordering", &["goal"]).await.unwrap();
    for expected in 1..=3 {
        let (sequence, delivery) = next_sequence(&mut stream).await;
        assert_eq!(sequence, expected);
        assert_eq!(delivery.message().key, "7");
        delivery.ack().await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn nack_redelivers_the_same_message() {
    let (_kafka, bus) = start_kafka().await;
    bus.publish("goal", "1", &goal_event(1, 1)).await.unwrap();
    bus.publish("goal", "1", &goal_event(1, 2)).await.unwrap();

    let mut stream = bus.subscribe("redelivery", &["goal"]).await.unwrap();
    let (first, delivery) = next_sequence(&mut stream).await;
    assert_eq!(first, 1);
    delivery.nack().await.unwrap();

    let (again, delivery) = next_sequence(&mut stream).await;
    assert_eq!(again, 1);
    delivery.ack().await.unwrap();

    let (next, delivery) = next_sequence(&mut stream).await;
    assert_eq!(next, 2);
    delivery.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn acked_offsets_survive_resubscription() {
    let (_kafka, bus) = start_kafka().await;
    bus.publish("goal", "3", &goal_event(3, 1)).await.unwrap();
    bus.publish("goal", "3", &goal_event(3, 2)).await.unwrap();

    {
        let mut stream = bus.subscribe("resume", &["goal"]).await.unwrap();
        let (sequence, delivery) = next_sequence(&mut stream).await;
        assert_eq!(sequence, 1);
        delivery.ack().await.unwrap();
        // Let the async commit reach the broker before leaving the group.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let mut stream = bus.subscribe("resume", &["goal"]).await.unwrap();
    let (sequence, delivery) = next_sequence(&mut stream).await;
    assert_eq!(sequence, 2);
    delivery.ack().await.unwrap();
}
