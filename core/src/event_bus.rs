//! Keyed, acknowledged transport abstraction.
//!
//! The outbox publisher forwards committed events through [`EventBus::publish`]
//! keyed by entity id, so every event of one entity lands on the same
//! partition and keeps its order. Consumers receive [`Delivery`] values and
//! must settle each one:
//!
//! - [`Delivery::ack`] marks the message processed and moves the group past it
//! - [`Delivery::nack`] leaves it unprocessed so it is delivered again
//!
//! A subscription hands out one delivery at a time per partition: the next
//! message of the same partition is not yielded before the previous one was
//! settled. This keeps per-entity order intact across redeliveries.
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `wattwise-testing` for tests
//! - `RedpandaEventBus` in `wattwise-redpanda` for production

use crate::BoxFuture;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Broker did not confirm the publish in time
    #[error("Publish to topic '{topic}' timed out")]
    PublishTimeout {
        /// The topic that timed out
        topic: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Settling a delivery failed (offset commit or seek)
    #[error("Acknowledgement failed: {0}")]
    AcknowledgeFailed(String),

    /// Generic transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl EventBusError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Subscription errors are configuration problems and are not retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::SubscriptionFailed { .. })
    }
}

/// Raw message as carried by the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Message key (entity id)
    pub key: String,
    /// Message value (JSON envelope bytes)
    pub payload: Vec<u8>,
}

impl fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessage")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Outcome reported back to the transport for one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; commit past this message
    Ack,
    /// Not processed; deliver again
    Nack,
}

/// Transport-specific settlement of one delivery.
pub trait Acknowledger: Send {
    /// Report the outcome of processing.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AcknowledgeFailed`] when the transport cannot
    /// record the outcome.
    fn settle(self: Box<Self>, settlement: Settlement) -> BoxFuture<'static, Result<(), EventBusError>>;
}

/// One message handed to a consumer, together with its acknowledger.
pub struct Delivery {
    message: TransportMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Pair a message with the acknowledger that settles it.
    #[must_use]
    pub fn new(message: TransportMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &TransportMessage {
        &self.message
    }

    /// Settle with the given outcome.
    ///
    /// # Errors
    ///
    /// Propagates the transport's acknowledgement error.
    pub async fn settle(self, settlement: Settlement) -> Result<(), EventBusError> {
        self.acker.settle(settlement).await
    }

    /// Acknowledge: the message was handled (or deliberately discarded).
    ///
    /// # Errors
    ///
    /// Propagates the transport's acknowledgement error.
    pub async fn ack(self) -> Result<(), EventBusError> {
        self.settle(Settlement::Ack).await
    }

    /// Negative-acknowledge: the message must be delivered again.
    ///
    /// # Errors
    ///
    /// Propagates the transport's acknowledgement error.
    pub async fn nack(self) -> Result<(), EventBusError> {
        self.settle(Settlement::Nack).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").field("message", &self.message).finish_non_exhaustive()
    }
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Keyed publish/subscribe transport.
///
/// Methods return boxed futures so the trait stays dyn-compatible and can be
/// shared as `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish `payload` to `topic` under `key`.
    ///
    /// Returns once the broker confirmed the write.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] or
    /// [`EventBusError::PublishTimeout`].
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Join consumer `group` on `topics`.
    ///
    /// Instances sharing a group split the partitions between them; distinct
    /// groups each see every message.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe<'a>(
        &'a self,
        group: &'a str,
        topics: &'a [&'a str],
    ) -> BoxFuture<'a, Result<DeliveryStream, EventBusError>>;
}
