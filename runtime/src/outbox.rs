//! Transactional outbox publisher.
//!
//! [`OutboxPublisher::publish`] commits a [`Change`] through the record store,
//! which writes the entity and appends its events to the outbox in one
//! transaction. Forwarding to the transport happens afterwards, in the relay:
//!
//! ```text
//! publish(change) ──► commit (entity + outbox rows) ──► wake relay
//!                                                          │
//!        ┌─────────────────────────────────────────────────┘
//!        ▼
//! sweep: pending rows in commit order
//!        ├─ send keyed by entity id (timeout + capped backoff)
//!        ├─ ok       → mark forwarded
//!        ├─ failure  → attempts += 1, skip later rows of the same entity
//!        └─ attempts ≥ ceiling → dead-letter + mark dead-lettered
//! ```
//!
//! Rows of one entity are forwarded strictly in sequence order: once a row
//! fails, later rows of the same entity wait for the next sweep. Consumers
//! discard anything at or below the last sequence they processed, so sending
//! a later row first would make the earlier one look like a duplicate.
//!
//! One relay per deployment is assumed; a second relay only produces
//! duplicates, which consumers discard.

use crate::metrics::{OUTBOX_DEAD_LETTERED, OUTBOX_FORWARDED};
use crate::retry::{RetryPolicy, retry_with_predicate};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use wattwise_core::dead_letter::{DeadLetter, DeadLetterOrigin, DeadLetterSink};
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::event::EntityType;
use wattwise_core::event_bus::{EventBus, EventBusError};
use wattwise_core::store::{Change, CommitOutcome, OutboxEntry, OutboxStore, RecordStore};

/// Relay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// In-line retries of a single send
    pub send_policy: RetryPolicy,
    /// Bound on waiting for the broker's confirmation
    pub send_timeout: Duration,
    /// Rows fetched per sweep
    pub batch_size: usize,
    /// Sweep period when nothing wakes the relay
    pub sweep_interval: Duration,
    /// Failed sweeps after which a row is dead-lettered
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            send_policy: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
            send_timeout: Duration::from_secs(5),
            batch_size: 100,
            sweep_interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows confirmed by the transport
    pub forwarded: usize,
    /// Rows that failed and stay pending
    pub failed: usize,
    /// Rows skipped because an earlier row of the same entity failed
    pub deferred: usize,
    /// Rows given up on
    pub dead_lettered: usize,
}

impl SweepReport {
    /// Whether the sweep settled at least one row.
    #[must_use]
    pub const fn made_progress(&self) -> bool {
        self.forwarded + self.dead_lettered > 0
    }

    fn absorb(&mut self, other: Self) {
        self.forwarded += other.forwarded;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.dead_lettered += other.dead_lettered;
    }
}

enum Forwarded {
    Sent,
    Failed,
    DeadLettered,
}

/// Commits changes and relays their events to the transport.
///
/// Cheap to clone; clones share the relay wake-up signal.
#[derive(Clone)]
pub struct OutboxPublisher {
    records: Arc<dyn RecordStore>,
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    wake: Arc<Notify>,
}

impl OutboxPublisher {
    /// Create a publisher with default settings.
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        outbox: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            outbox,
            bus,
            dead_letters,
            clock,
            config: OutboxConfig::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Replace the relay settings.
    #[must_use]
    pub fn with_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Relay settings.
    #[must_use]
    pub const fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Apply `change` and append its events to the outbox atomically, then
    /// wake the relay.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotFound`] when the change references a missing
    /// entity, [`PipelineError::Store`] when the transaction fails. Nothing
    /// is forwarded in either case.
    pub async fn publish(&self, change: Change) -> Result<CommitOutcome, PipelineError> {
        let entity = change.entity_type();
        let outcome = self.records.commit(change).await?;

        match &outcome {
            CommitOutcome::Applied(entries) => {
                for entry in entries {
                    debug!(
                        event = %entry.event.key(),
                        kind = %entry.event.kind,
                        outbox_id = entry.id,
                        "Event appended to outbox"
                    );
                }
                self.wake.notify_one();
            }
            CommitOutcome::Unchanged => {
                debug!(entity = %entity, "Conditional write found nothing to change");
            }
        }
        Ok(outcome)
    }

    /// Forward one batch of pending rows.
    ///
    /// # Errors
    ///
    /// Returns store or dead-letter failures; transport failures are
    /// recorded on the row and reported in the [`SweepReport`] instead.
    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        let pending = self.outbox.pending(self.config.batch_size).await?;
        let mut report = SweepReport::default();
        let mut blocked: HashSet<(EntityType, i64)> = HashSet::new();

        for entry in pending {
            let stream = (entry.event.entity_type, entry.event.entity_id);
            if blocked.contains(&stream) {
                report.deferred += 1;
                continue;
            }
            match self.forward(&entry).await? {
                Forwarded::Sent => report.forwarded += 1,
                Forwarded::Failed => {
                    report.failed += 1;
                    blocked.insert(stream);
                }
                Forwarded::DeadLettered => report.dead_lettered += 1,
            }
        }

        if report.failed > 0 {
            warn!(
                forwarded = report.forwarded,
                failed = report.failed,
                deferred = report.deferred,
                "Outbox sweep left rows pending"
            );
        }
        Ok(report)
    }

    /// Sweep until a sweep settles nothing.
    ///
    /// # Errors
    ///
    /// Propagates the first sweep error.
    pub async fn drain(&self) -> Result<SweepReport, PipelineError> {
        let mut total = SweepReport::default();
        loop {
            let report = self.sweep().await?;
            total.absorb(report);
            if !report.made_progress() || report.failed > 0 {
                return Ok(total);
            }
        }
    }

    /// Rows still waiting for the transport.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Store`] on storage failure.
    pub async fn pending_count(&self) -> Result<u64, PipelineError> {
        Ok(self.outbox.count_pending().await?)
    }

    /// Run the relay until `shutdown` fires: drain on every wake-up from
    /// [`OutboxPublisher::publish`] and at least every sweep interval.
    #[must_use]
    pub fn spawn_relay(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_relay(shutdown).await })
    }

    async fn run_relay(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.sweep_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                () = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.drain().await {
                error!(error = %e, "Outbox sweep failed");
            }
        }

        info!("Outbox relay stopped");
    }

    async fn forward(&self, entry: &OutboxEntry) -> Result<Forwarded, PipelineError> {
        let topic = entry.topic().as_str();
        let key = entry.event.message_key();
        let payload = match entry.event.to_json_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.give_up(entry, Vec::new(), e.to_string(), entry.attempts + 1)
                    .await?;
                return Ok(Forwarded::DeadLettered);
            }
        };

        let sent = retry_with_predicate(
            &self.config.send_policy,
            || self.send(topic, &key, &payload),
            EventBusError::is_transient,
        )
        .await;

        match sent {
            Ok(()) => {
                self.outbox.mark_forwarded(entry.id).await?;
                metrics::counter!(OUTBOX_FORWARDED, "topic" => topic).increment(1);
                debug!(event = %entry.event.key(), topic, "Event forwarded");
                Ok(Forwarded::Sent)
            }
            Err(err) => {
                let attempts = self.outbox.record_failure(entry.id, err.to_string()).await?;
                if !err.is_transient() || attempts >= self.config.max_attempts {
                    self.give_up(entry, payload, err.to_string(), attempts).await?;
                    return Ok(Forwarded::DeadLettered);
                }
                warn!(
                    event = %entry.event.key(),
                    topic,
                    attempts,
                    error = %err,
                    "Forwarding failed, row stays pending"
                );
                Ok(Forwarded::Failed)
            }
        }
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), EventBusError> {
        tokio::time::timeout(self.config.send_timeout, self.bus.publish(topic, key, payload))
            .await
            .unwrap_or_else(|_| {
                Err(EventBusError::PublishTimeout {
                    topic: topic.to_string(),
                })
            })
    }

    async fn give_up(
        &self,
        entry: &OutboxEntry,
        payload: Vec<u8>,
        error: String,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        error!(
            event = %entry.event.key(),
            outbox_id = entry.id,
            attempts,
            error = %error,
            "Giving up on outbox row"
        );
        self.dead_letters
            .dead_letter(DeadLetter {
                origin: DeadLetterOrigin::Outbox { outbox_id: entry.id },
                topic: entry.topic().as_str().to_string(),
                key: entry.event.message_key(),
                payload,
                error,
                attempts,
                failed_at: self.clock.now(),
            })
            .await?;
        self.outbox.mark_dead_lettered(entry.id).await?;
        metrics::counter!(OUTBOX_DEAD_LETTERED).increment(1);
        Ok(())
    }
}
