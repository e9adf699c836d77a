//! Background worker driving one [`Dispatcher`] off the event bus.
//!
//! The worker runs a subscribe-process-reconnect loop:
//!
//! ```text
//! loop {
//!     subscribe(group = dispatcher name, topics = dispatcher topics)
//!     for each delivery:
//!         disposition = dispatcher.on_message(message)
//!         ack, or back off and nack so the transport redelivers
//!     stream ended or subscribe failed: wait retry_delay, reconnect
//! }
//! ```
//!
//! A delivery is always settled before the next one is pulled, so within a
//! partition one message is in flight at a time and per-entity order holds.

use crate::dispatcher::{Disposition, Dispatcher};
use crate::retry::RetryPolicy;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wattwise_core::event_bus::{Delivery, DeliveryStream, EventBus};

/// Event bus consumer for one dispatcher.
pub struct ConsumerWorker {
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn EventBus>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    redelivery: RetryPolicy,
}

impl ConsumerWorker {
    /// Create a worker with a 5 second reconnect delay and a jittered
    /// redelivery backoff of 100ms up to 10s.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        bus: Arc<dyn EventBus>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            dispatcher,
            bus,
            shutdown,
            retry_delay: Duration::from_secs(5),
            redelivery: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(10))
                .jitter(true)
                .build(),
        }
    }

    /// Delay before resubscribing after the stream ends or subscribing fails.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Backoff applied before nacking a failed delivery.
    #[must_use]
    pub fn with_redelivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Name of the underlying dispatcher.
    #[must_use]
    pub fn name(&self) -> &str {
        self.dispatcher.name()
    }

    /// Run the worker as a background task until shutdown is signalled.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        let name = self.dispatcher.name().to_string();
        let topics = self.dispatcher.topics();
        info!(consumer = %name, topics = ?topics, "Consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %name, "Consumer received shutdown signal");
                    break;
                }
                subscription = self.bus.subscribe(&name, &topics) => {
                    match subscription {
                        Ok(mut stream) => {
                            info!(consumer = %name, "Subscribed to event bus");
                            if self.process_stream(&mut stream).await {
                                break;
                            }
                            warn!(
                                consumer = %name,
                                "Delivery stream ended, reconnecting in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %name,
                                error = %e,
                                "Failed to subscribe, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(consumer = %name, "Consumer stopped");
    }

    /// Returns `true` when shutdown was requested.
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.dispatcher.name(), "Shutdown requested during processing");
                    return true;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.settle(delivery).await,
                    Some(Err(e)) => {
                        error!(consumer = %self.dispatcher.name(), error = %e, "Error receiving delivery");
                    }
                    None => return false,
                },
            }
        }
    }

    async fn settle(&self, delivery: Delivery) {
        let disposition = self.dispatcher.on_message(delivery.message()).await;
        debug!(
            consumer = %self.dispatcher.name(),
            topic = %delivery.message().topic,
            key = %delivery.message().key,
            %disposition,
            "Delivery handled"
        );

        let settled = match disposition {
            Disposition::Retry { attempt } => {
                tokio::time::sleep(self.redelivery.delay_for_attempt(attempt.saturating_sub(1))).await;
                delivery.nack().await
            }
            _ => delivery.ack().await,
        };
        if let Err(e) = settled {
            // The transport will redeliver; the ledger absorbs the duplicate.
            warn!(consumer = %self.dispatcher.name(), error = %e, "Failed to settle delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::dead_letter::DeadLetterQueue;
    use crate::dispatcher::{EventHandler, HandlerError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use wattwise_core::environment::Clock;
    use wattwise_core::event::{DomainEvent, EntityType, EventKind};
    use wattwise_testing::{InMemoryEventBus, InMemorySequenceLedger, test_clock};

    struct Recording {
        seen: Mutex<Vec<u64>>,
        flaky_sequence: u64,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl EventHandler for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
            if event.sequence == self.flaky_sequence {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(HandlerError::Transient("not yet".to_string()));
                }
            }
            self.seen.lock().unwrap().push(event.sequence);
            Ok(())
        }
    }

    async fn publish(bus: &InMemoryEventBus, sequence: u64) {
        let event = DomainEvent::from_snapshot(
            EntityType::Goal,
            1,
            EventKind::Updated,
            sequence,
            &serde_json::json!({}),
            test_clock().now(),
        )
        .unwrap();
        bus.publish("goal", "1", &event.to_json_bytes().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn processes_in_order_across_redeliveries() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            flaky_sequence: 2,
            failures_left: Mutex::new(2),
        });
        let dispatcher = Arc::new(
            Dispatcher::new(
                "recorder",
                Arc::new(InMemorySequenceLedger::new()),
                Arc::new(DeadLetterQueue::new(8)),
                Arc::new(test_clock()),
            )
            .with_handler(EntityType::Goal, handler.clone()),
        );

        for sequence in [1, 2, 2, 3] {
            publish(&bus, sequence).await;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = ConsumerWorker::new(dispatcher, Arc::new(bus.clone()), shutdown_rx)
            .with_retry_delay(Duration::from_millis(10))
            .with_redelivery_policy(RetryPolicy::immediate())
            .spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.seen.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(bus.wait_idle(Duration::from_secs(5)).await);
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stops_on_shutdown_while_idle() {
        let bus = InMemoryEventBus::new();
        let dispatcher = Arc::new(
            Dispatcher::new(
                "idle",
                Arc::new(InMemorySequenceLedger::new()),
                Arc::new(DeadLetterQueue::new(8)),
                Arc::new(test_clock()),
            )
            .with_handler(
                EntityType::Goal,
                Arc::new(Recording {
                    seen: Mutex::new(Vec::new()),
                    flaky_sequence: 0,
                    failures_left: Mutex::new(0),
                }),
            ),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = ConsumerWorker::new(dispatcher, Arc::new(bus), shutdown_rx).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(()).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(5), worker).await.is_ok());
    }
}
