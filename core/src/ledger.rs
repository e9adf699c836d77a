//! Per-consumer sequence ledger.
//!
//! Consumers deduplicate redelivered events by remembering, for each
//! `(consumer, entityType, entityId)`, the highest sequence they fully
//! processed. The ledger is shared storage, never process-local state, so
//! several instances of the same consumer agree on it. Advancing uses
//! compare-and-advance: the write only succeeds if nobody moved the row since
//! it was read.

use crate::BoxFuture;
use crate::event::{DomainEvent, EntityType};
use std::fmt;
use thiserror::Error;

/// Errors raised by ledger adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Backing storage failed
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Row key of the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    /// Consumer name (one per component)
    pub consumer: String,
    /// Entity type of the event stream
    pub entity_type: EntityType,
    /// Entity id of the event stream
    pub entity_id: i64,
}

impl LedgerKey {
    /// Key of `event`'s stream for `consumer`.
    #[must_use]
    pub fn for_event(consumer: &str, event: &DomainEvent) -> Self {
        Self {
            consumer: consumer.to_string(),
            entity_type: event.entity_type,
            entity_id: event.entity_id,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.consumer, self.entity_type, self.entity_id)
    }
}

/// Shared dedup ledger.
pub trait SequenceLedger: Send + Sync {
    /// Highest processed sequence, `None` if the stream was never seen.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on storage failure.
    fn last_processed(&self, key: LedgerKey) -> BoxFuture<'_, Result<Option<u64>, LedgerError>>;

    /// Set the row to `next` if it still holds `expected` and `next` is
    /// greater. Returns whether the write happened.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on storage failure.
    fn compare_and_advance(
        &self,
        key: LedgerKey,
        expected: Option<u64>,
        next: u64,
    ) -> BoxFuture<'_, Result<bool, LedgerError>>;
}
