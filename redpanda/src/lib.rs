//! Redpanda event bus for the WattWise pipeline.
//!
//! Implements the [`EventBus`] port from `wattwise-core` on top of rdkafka,
//! so it works against Redpanda or any Kafka-compatible broker.
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual offset management:
//!
//! - publishes are keyed by entity id, so all events of one entity share a
//!   partition and keep their order
//! - auto-commit is off; the offset of a message is committed only when the
//!   consumer acks its [`Delivery`]
//! - a nack seeks the partition back to the message, which is then delivered
//!   again
//! - a subscription yields the next message only after the previous one was
//!   settled
//!
//! # Example
//!
//! ```no_run
//! use wattwise_redpanda::RedpandaEventBus;
//! use wattwise_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .group_prefix("wattwise-")
//!     .build()?;
//!
//! bus.publish("goal", "7", br#"{"entityType":"goal"}"#).await?;
//!
//! let mut deliveries = bus.subscribe("notifier", &["goal"]).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("{}", delivery.message().key);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use wattwise_core::BoxFuture;
use wattwise_core::event_bus::{
    Acknowledger, Delivery, DeliveryStream, EventBus, EventBusError, Settlement, TransportMessage,
};

/// Kafka-compatible event bus.
///
/// # Configuration
///
/// - **Brokers**: bootstrap servers (required)
/// - **Producer**: acks (default `all`), compression, send timeout
/// - **Consumer**: group prefix, offset reset policy (default `earliest`)
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    group_prefix: String,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Bus with default settings for `brokers`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Builder for custom configuration.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Full consumer group id for a logical consumer name.
    #[must_use]
    pub fn group_id(&self, group: &str) -> String {
        format!("{}{group}", self.group_prefix)
    }
}

impl std::fmt::Debug for RedpandaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaEventBus")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .field("group_prefix", &self.group_prefix)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Debug, Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    group_prefix: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement level: `0`, `1` or `all`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `none`, `gzip`, `snappy`, `lz4` or `zstd`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long a publish may wait for the broker (default 5s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Prefix prepended to every consumer group name.
    #[must_use]
    pub fn group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = Some(prefix.into());
        self
    }

    /// Where a new consumer group starts reading: `earliest` or `latest`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the producer and the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are missing or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", &compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            group_prefix: self.group_prefix.unwrap_or_default(),
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).key(key).payload(payload);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic, key, partition, offset, "Message published");
                    Ok(())
                }
                Err((rdkafka::error::KafkaError::MessageProduction(code), _))
                    if code == rdkafka::types::RDKafkaErrorCode::MessageTimedOut =>
                {
                    tracing::warn!(topic, key, "Publish timed out");
                    Err(EventBusError::PublishTimeout {
                        topic: topic.to_string(),
                    })
                }
                Err((e, _)) => {
                    tracing::warn!(topic, key, error = %e, "Publish failed");
                    Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        group: &'a str,
        topics: &'a [&'a str],
    ) -> BoxFuture<'a, Result<DeliveryStream, EventBusError>> {
        Box::pin(async move {
            let topic_names: Vec<String> = topics.iter().map(ToString::to_string).collect();
            let group_id = self.group_id(group);
            let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
                topics: topic_names.clone(),
                reason,
            };

            if topics.is_empty() {
                return Err(subscription_failed("no topics given".to_string()));
            }

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            consumer
                .subscribe(topics)
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                topics = ?topic_names,
                group = %group_id,
                "Subscribed to topics"
            );

            let (tx, mut rx) = mpsc::channel(1);
            let timeout = self.timeout;
            tokio::spawn(pump(consumer, tx, timeout));

            let stream = async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield delivery;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Position of a consumed message.
#[derive(Debug, Clone)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

/// Owns the consumer: hands out one delivery, waits for its settlement,
/// then commits or seeks back before reading on.
async fn pump(
    consumer: StreamConsumer,
    tx: mpsc::Sender<Result<Delivery, EventBusError>>,
    timeout: Duration,
) {
    loop {
        let (message, position) = match consumer.recv().await {
            Ok(borrowed) => {
                let position = Position {
                    topic: borrowed.topic().to_string(),
                    partition: borrowed.partition(),
                    offset: borrowed.offset(),
                };
                let message = TransportMessage {
                    topic: position.topic.clone(),
                    key: borrowed
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default(),
                    payload: borrowed.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                };
                (message, position)
            }
            Err(e) => {
                let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        tracing::trace!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            "Received message"
        );

        let (settle_tx, settle_rx) = oneshot::channel();
        let delivery = Delivery::new(message, Box::new(RedpandaAcker { settle: settle_tx }));
        if tx.send(Ok(delivery)).await.is_err() {
            tracing::debug!("Subscriber dropped, exiting consumer task");
            break;
        }

        // A delivery dropped without settling counts as a nack.
        let settlement = settle_rx.await.unwrap_or(Settlement::Nack);
        let settled = match settlement {
            Settlement::Ack => commit(&consumer, &position),
            Settlement::Nack => seek_back(&consumer, &position, timeout),
        };
        if let Err(e) = settled {
            tracing::warn!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                error = %e,
                "Failed to settle message; it may be redelivered"
            );
        }
    }

    tracing::debug!("Consumer task exiting");
}

fn commit(consumer: &StreamConsumer, position: &Position) -> Result<(), rdkafka::error::KafkaError> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(
        &position.topic,
        position.partition,
        Offset::Offset(position.offset + 1),
    )?;
    consumer.commit(&offsets, CommitMode::Async)
}

fn seek_back(
    consumer: &StreamConsumer,
    position: &Position,
    timeout: Duration,
) -> Result<(), rdkafka::error::KafkaError> {
    consumer.seek(
        &position.topic,
        position.partition,
        Offset::Offset(position.offset),
        Timeout::After(timeout),
    )
}

struct RedpandaAcker {
    settle: oneshot::Sender<Settlement>,
}

impl Acknowledger for RedpandaAcker {
    fn settle(self: Box<Self>, settlement: Settlement) -> BoxFuture<'static, Result<(), EventBusError>> {
        let sent = self.settle.send(settlement);
        Box::pin(async move {
            sent.map_err(|_| EventBusError::AcknowledgeFailed("consumer task stopped".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn build_requires_brokers() {
        let err = RedpandaEventBus::builder().build().unwrap_err();
        assert!(matches!(err, EventBusError::ConnectionFailed(_)));
    }

    #[test]
    fn group_ids_carry_the_prefix() {
        let bus = RedpandaEventBus::builder()
            .brokers("localhost:9092")
            .group_prefix("wattwise-")
            .build()
            .unwrap();
        assert_eq!(bus.group_id("notifier"), "wattwise-notifier");
        assert_eq!(bus.brokers(), "localhost:9092");
    }

    #[tokio::test]
    async fn dropped_subscriber_fails_acknowledgement() {
        let (settle, rx) = oneshot::channel();
        drop(rx);
        let acker = Box::new(RedpandaAcker { settle });
        let err = acker.settle(Settlement::Ack).await.unwrap_err();
        assert!(matches!(err, EventBusError::AcknowledgeFailed(_)));
    }
}
