//! Pipeline-wide error taxonomy.
//!
//! Validation failures are returned synchronously by the write entrypoints
//! and never reach the outbox. Everything after publication is asynchronous
//! and surfaces through logs, metrics and the dead-letter sink. Duplicate
//! delivery is not an error.

use crate::dead_letter::DeadLetterError;
use crate::event::{EntityType, EventError};
use crate::event_bus::EventBusError;
use crate::ledger::LedgerError;
use crate::model::ValidationError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by pipeline operations.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Referenced entity does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type
        entity: EntityType,
        /// Entity id
        id: i64,
    },

    /// Input rejected before anything was written
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Transport did not accept a message; retrying may succeed
    #[error("Transient transport failure: {0}")]
    TransientTransport(#[from] EventBusError),

    /// Message can never be processed
    #[error("Poison message on topic '{topic}': {reason}")]
    PoisonMessage {
        /// Topic it arrived on
        topic: String,
        /// Why it is poison
        reason: String,
    },

    /// Record store failure
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Dedup ledger failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Dead-letter sink failure
    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// Envelope encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] EventError),
}

impl PipelineError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::TransientTransport(err) => err.is_transient(),
            Self::Store(err) => err.is_transient(),
            Self::Ledger(_) | Self::DeadLetter(_) => true,
            Self::NotFound { .. }
            | Self::Validation(_)
            | Self::PoisonMessage { .. }
            | Self::Serialization(_) => false,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Store(other),
        }
    }
}
