//! In-memory keyed event bus.
//!
//! Every topic is a single append-only log (one partition). Each consumer
//! group keeps a cursor per topic: `next` is the next index to hand out,
//! `committed` the first index not yet acknowledged. At most one delivery per
//! `(group, topic)` is in flight; nack rewinds `next` to the nacked index, so
//! the same message comes back before anything behind it, exactly like a
//! seek-back on a real partition.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use wattwise_core::BoxFuture;
use wattwise_core::event_bus::{
    Acknowledger, Delivery, DeliveryStream, EventBus, EventBusError, Settlement, TransportMessage,
};

#[derive(Debug, Default)]
struct Cursor {
    next: usize,
    committed: usize,
    in_flight: bool,
}

#[derive(Debug, Default)]
struct BusState {
    logs: HashMap<String, Vec<TransportMessage>>,
    cursors: HashMap<(String, String), Cursor>,
    failures_to_inject: u32,
}

impl BusState {
    fn next_delivery(&mut self, group: &str, topics: &[String]) -> Option<(String, usize, TransportMessage)> {
        for topic in topics {
            let Some(log) = self.logs.get(topic) else {
                continue;
            };
            let cursor = self
                .cursors
                .entry((group.to_string(), topic.clone()))
                .or_default();
            if cursor.in_flight || cursor.next >= log.len() {
                continue;
            }
            let index = cursor.next;
            cursor.next += 1;
            cursor.in_flight = true;
            return Some((topic.clone(), index, log[index].clone()));
        }
        None
    }
}

/// In-memory [`EventBus`] for tests.
///
/// Clones share the same logs.
#[derive(Clone)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            changes: Arc::new(changes),
        }
    }

    /// Make the next `count` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().unwrap().failures_to_inject = count;
    }

    /// Messages published to `topic`, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<TransportMessage> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Hand out the next deliverable message for `group`, if any.
    ///
    /// Registers the group on every topic it asks for, so a topic that is
    /// still empty counts towards [`InMemoryEventBus::is_idle`] once it
    /// receives messages.
    #[must_use]
    pub fn try_next(&self, group: &str, topics: &[&str]) -> Option<Delivery> {
        let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();
        let mut state = self.state.lock().unwrap();
        for topic in &topics {
            state
                .cursors
                .entry((group.to_string(), topic.clone()))
                .or_default();
        }
        let (topic, index, message) = state.next_delivery(group, &topics)?;
        drop(state);
        Some(self.delivery(group, topic, index, message))
    }

    /// Whether every registered group has acknowledged everything on its
    /// topics.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.cursors.iter().all(|((_, topic), cursor)| {
            let len = state.logs.get(topic).map_or(0, Vec::len);
            !cursor.in_flight && cursor.committed >= len
        })
    }

    /// Wait until [`InMemoryEventBus::is_idle`] holds, up to `timeout`.
    /// Returns whether it did.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while !self.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    fn delivery(&self, group: &str, topic: String, index: usize, message: TransportMessage) -> Delivery {
        Delivery::new(
            message,
            Box::new(InMemoryAcker {
                state: Arc::clone(&self.state),
                changes: Arc::clone(&self.changes),
                group: group.to_string(),
                topic,
                index,
            }),
        )
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if state.failures_to_inject > 0 {
                    state.failures_to_inject -= 1;
                    return Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "injected failure".to_string(),
                    });
                }
                state.logs.entry(topic.to_string()).or_default().push(TransportMessage {
                    topic: topic.to_string(),
                    key: key.to_string(),
                    payload: payload.to_vec(),
                });
            }
            self.notify();
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        group: &'a str,
        topics: &'a [&'a str],
    ) -> BoxFuture<'a, Result<DeliveryStream, EventBusError>> {
        Box::pin(async move {
            if topics.is_empty() {
                return Err(EventBusError::SubscriptionFailed {
                    topics: Vec::new(),
                    reason: "no topics given".to_string(),
                });
            }
            let bus = self.clone();
            let group = group.to_string();
            let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();
            {
                let mut state = bus.state.lock().unwrap();
                for topic in &topics {
                    state.cursors.entry((group.clone(), topic.clone())).or_default();
                }
            }

            let stream = async_stream::stream! {
                let mut changes = bus.changes.subscribe();
                loop {
                    drop(changes.borrow_and_update());
                    let next = bus.state.lock().unwrap().next_delivery(&group, &topics);
                    if let Some((topic, index, message)) = next {
                        yield Ok(bus.delivery(&group, topic, index, message));
                        continue;
                    }
                    if changes.changed().await.is_err() {
                        break;
                    }
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BusState>>,
    changes: Arc<watch::Sender<u64>>,
    group: String,
    topic: String,
    index: usize,
}

impl Acknowledger for InMemoryAcker {
    fn settle(self: Box<Self>, settlement: Settlement) -> BoxFuture<'static, Result<(), EventBusError>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                let cursor = state
                    .cursors
                    .get_mut(&(self.group.clone(), self.topic.clone()))
                    .ok_or_else(|| EventBusError::AcknowledgeFailed(format!(
                        "group '{}' is not subscribed to '{}'",
                        self.group, self.topic
                    )))?;
                cursor.in_flight = false;
                match settlement {
                    Settlement::Ack => cursor.committed = cursor.committed.max(self.index + 1),
                    Settlement::Nack => cursor.next = self.index,
                }
            }
            self.changes.send_modify(|version| *version += 1);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn groups_see_every_message_independently() {
        let bus = InMemoryEventBus::new();
        bus.publish("goal", "1", b"a").await.unwrap();
        bus.publish("goal", "2", b"b").await.unwrap();

        for group in ["notifier", "unlocker"] {
            let first = bus.try_next(group, &["goal"]).unwrap();
            assert_eq!(first.message().key, "1");
            first.ack().await.unwrap();
            let second = bus.try_next(group, &["goal"]).unwrap();
            assert_eq!(second.message().key, "2");
            second.ack().await.unwrap();
            assert!(bus.try_next(group, &["goal"]).is_none());
        }
        assert!(bus.is_idle());
    }

    #[tokio::test]
    async fn nack_redelivers_before_later_messages() {
        let bus = InMemoryEventBus::new();
        bus.publish("consumption", "1", b"first").await.unwrap();
        bus.publish("consumption", "1", b"second").await.unwrap();

        let delivery = bus.try_next("g", &["consumption"]).unwrap();
        assert!(bus.try_next("g", &["consumption"]).is_none(), "one in flight per topic");
        delivery.nack().await.unwrap();

        let again = bus.try_next("g", &["consumption"]).unwrap();
        assert_eq!(again.message().payload, b"first");
        assert!(!bus.is_idle());
        again.ack().await.unwrap();

        let next = bus.try_next("g", &["consumption"]).unwrap();
        assert_eq!(next.message().payload, b"second");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);
        assert!(bus.publish("goal", "1", b"x").await.is_err());
        assert!(bus.publish("goal", "1", b"x").await.is_ok());
        assert_eq!(bus.published("goal").len(), 1);
    }

    #[tokio::test]
    async fn subscription_streams_new_messages() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("g", &["tariff-flag"]).await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish("tariff-flag", "9", b"flag").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message().key, "9");
        delivery.ack().await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)).await);
    }
}
