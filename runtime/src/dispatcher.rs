//! Consumer-side deduplication and handler fan-out.
//!
//! A [`Dispatcher`] is one logical consumer (one consumer group). For every
//! raw message it:
//!
//! 1. decodes the [`DomainEvent`]; undecodable bytes are poison and go to
//!    the dead-letter sink at once
//! 2. reads the last processed sequence for `(consumer, entityType, entityId)`
//!    from the shared [`SequenceLedger`]
//! 3. discards the event if its sequence is not above that value
//! 4. runs every handler registered for the entity type, in registration
//!    order
//! 5. only when all of them succeed, advances the ledger with
//!    compare-and-advance
//!
//! The returned [`Disposition`] tells the worker whether to acknowledge.
//! Transient handler failures are retried through redelivery up to
//! `max_attempts`; after that, or on a permanent failure, the message is
//! dead-lettered and acknowledged so the partition keeps moving.
//!
//! Attempt counts live in memory per instance. When another instance ends up
//! processing an event (redelivery after a rebalance), this instance drops
//! its count as soon as it sees that event or a later one of the same
//! entity again; the map is also capped at [`MAX_TRACKED_ATTEMPTS`].

use crate::metrics::{DISPATCHER_DEAD_LETTERED, DISPATCHER_DUPLICATES, DISPATCHER_PROCESSED};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};
use wattwise_core::dead_letter::{DeadLetter, DeadLetterOrigin, DeadLetterSink};
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::event::{DomainEvent, EntityType, EventKey};
use wattwise_core::event_bus::TransportMessage;
use wattwise_core::ledger::{LedgerKey, SequenceLedger};
use wattwise_core::store::StoreError;

/// Failure reported by an [`EventHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Retrying later may succeed (database or transport hiccup)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Retrying will never succeed
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Whether the dispatcher should retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<PipelineError> for HandlerError {
    fn from(err: PipelineError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// Reaction to one kind of domain event.
///
/// Handlers must be idempotent: the ledger guarantees at-most-once success
/// per sequence only as long as handlers finish; a crash between a handler's
/// write and the ledger advance redelivers the event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// React to `event`.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Transient`] to have the event redelivered,
    /// [`HandlerError::Permanent`] to dead-letter it.
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

/// What the worker should do with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// All handlers succeeded and the ledger advanced
    Processed,
    /// Sequence already processed; nothing ran
    Duplicate,
    /// No handler is registered for the entity type
    Ignored,
    /// Redeliver; `attempt` failed attempts so far
    Retry {
        /// Failed attempts for this event
        attempt: u32,
    },
    /// Stored in the dead-letter sink
    DeadLettered,
}

impl Disposition {
    /// Whether the message should be acknowledged.
    #[must_use]
    pub const fn should_ack(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processed => f.write_str("processed"),
            Self::Duplicate => f.write_str("duplicate"),
            Self::Ignored => f.write_str("ignored"),
            Self::Retry { attempt } => write!(f, "retry({attempt})"),
            Self::DeadLettered => f.write_str("dead-lettered"),
        }
    }
}

/// Events with a pending retry count one instance keeps track of. Past this,
/// the lowest keys are forgotten and restart from zero attempts.
pub const MAX_TRACKED_ATTEMPTS: usize = 10_000;

/// One logical consumer with its handlers.
pub struct Dispatcher {
    name: String,
    handlers: HashMap<EntityType, Vec<Arc<dyn EventHandler>>>,
    ledger: Arc<dyn SequenceLedger>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    attempts: Mutex<BTreeMap<EventKey, u32>>,
    attempt_capacity: usize,
}

impl Dispatcher {
    /// Create a dispatcher named `name`; the name doubles as consumer group
    /// and ledger namespace.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        ledger: Arc<dyn SequenceLedger>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            ledger,
            dead_letters,
            clock,
            max_attempts: 5,
            attempts: Mutex::new(BTreeMap::new()),
            attempt_capacity: MAX_TRACKED_ATTEMPTS,
        }
    }

    /// Register `handler` for events of `entity_type`.
    #[must_use]
    pub fn with_handler(mut self, entity_type: EntityType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.entry(entity_type).or_default().push(handler);
        self
    }

    /// Set the number of failed attempts after which a message is
    /// dead-lettered (default 5).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topics carrying the registered entity types, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<&'static str> {
        let mut topics: Vec<_> = self.handlers.keys().map(|e| e.topic().as_str()).collect();
        topics.sort_unstable();
        topics
    }

    /// Process one raw message.
    pub async fn on_message(&self, message: &TransportMessage) -> Disposition {
        let event = match DomainEvent::from_json_bytes(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                let poison = PipelineError::PoisonMessage {
                    topic: message.topic.clone(),
                    reason: e.to_string(),
                };
                return self.dead_letter(message, &poison.to_string(), 1).await;
            }
        };

        let Some(handlers) = self.handlers.get(&event.entity_type) else {
            debug!(consumer = %self.name, event = %event.key(), "No handler registered");
            return Disposition::Ignored;
        };

        let key = LedgerKey::for_event(&self.name, &event);
        let last = match self.ledger.last_processed(key.clone()).await {
            Ok(last) => last,
            Err(e) => {
                warn!(consumer = %self.name, event = %event.key(), error = %e, "Ledger unavailable");
                return self.record_failure(message, &event, &e.to_string()).await;
            }
        };

        if last.is_some_and(|seen| event.sequence <= seen) {
            debug!(
                consumer = %self.name,
                event = %event.key(),
                last_processed = ?last,
                "Duplicate event discarded"
            );
            metrics::counter!(DISPATCHER_DUPLICATES, "consumer" => self.name.clone()).increment(1);
            self.forget_through(&event.key());
            return Disposition::Duplicate;
        }

        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                warn!(
                    consumer = %self.name,
                    handler = handler.name(),
                    event = %event.key(),
                    error = %err,
                    "Handler failed"
                );
                let reason = format!("{}: {err}", handler.name());
                return match err {
                    HandlerError::Permanent(_) => {
                        let attempts = self.forget(&event.key()) + 1;
                        self.dead_letter(message, &reason, attempts).await
                    }
                    HandlerError::Transient(_) => {
                        self.record_failure(message, &event, &reason).await
                    }
                };
            }
        }

        match self
            .ledger
            .compare_and_advance(key, last, event.sequence)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(
                consumer = %self.name,
                event = %event.key(),
                "Ledger moved concurrently; handlers were idempotent"
            ),
            Err(e) => {
                return self.record_failure(message, &event, &e.to_string()).await;
            }
        }

        self.forget_through(&event.key());
        metrics::counter!(DISPATCHER_PROCESSED, "consumer" => self.name.clone()).increment(1);
        debug!(consumer = %self.name, event = %event.key(), "Event processed");
        Disposition::Processed
    }

    async fn record_failure(
        &self,
        message: &TransportMessage,
        event: &DomainEvent,
        reason: &str,
    ) -> Disposition {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let key = event.key();
            while !attempts.contains_key(&key) && attempts.len() >= self.attempt_capacity {
                if attempts.pop_first().is_none() {
                    break;
                }
            }
            let count = attempts.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        if attempt >= self.max_attempts {
            self.forget(&event.key());
            return self.dead_letter(message, reason, attempt).await;
        }
        Disposition::Retry { attempt }
    }

    /// Drop counts for `key` and every earlier sequence of its entity; the
    /// ledger is past all of them.
    fn forget_through(&self, key: &EventKey) {
        let first = EventKey { sequence: 0, ..*key };
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let settled: Vec<EventKey> = attempts.range(first..=*key).map(|(k, _)| *k).collect();
        for k in settled {
            attempts.remove(&k);
        }
    }

    fn forget(&self, key: &EventKey) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .unwrap_or(0)
    }

    async fn dead_letter(&self, message: &TransportMessage, reason: &str, attempts: u32) -> Disposition {
        let letter = DeadLetter {
            origin: DeadLetterOrigin::Consumer {
                consumer: self.name.clone(),
            },
            topic: message.topic.clone(),
            key: message.key.clone(),
            payload: message.payload.clone(),
            error: reason.to_string(),
            attempts,
            failed_at: self.clock.now(),
        };
        match self.dead_letters.dead_letter(letter).await {
            Ok(()) => {
                error!(
                    consumer = %self.name,
                    topic = %message.topic,
                    key = %message.key,
                    attempts,
                    error = reason,
                    "Message dead-lettered"
                );
                metrics::counter!(DISPATCHER_DEAD_LETTERED, "consumer" => self.name.clone())
                    .increment(1);
                Disposition::DeadLettered
            }
            Err(e) => {
                error!(
                    consumer = %self.name,
                    error = %e,
                    "Dead-letter sink unavailable, message will be redelivered"
                );
                Disposition::Retry { attempt: attempts }
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("topics", &self.topics())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
