//! Dead-letter sink port.
//!
//! Anything the pipeline gives up on (an outbox row past its sweep ceiling, a
//! poison message, a handler failing permanently or beyond the retry ceiling)
//! is written to a [`DeadLetterSink`] and logged. Nothing is dropped silently.

use crate::{BoxFuture, DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by dead-letter adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// Backing storage failed
    #[error("Dead-letter storage error: {0}")]
    Storage(String),

    /// Entry id unknown
    #[error("Dead letter {0} not found")]
    NotFound(i64),
}

/// Where the failure happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "kebab-case")]
pub enum DeadLetterOrigin {
    /// Outbox relay could not forward a row
    Outbox {
        /// Outbox row id
        outbox_id: i64,
    },
    /// A consumer could not process a delivery
    Consumer {
        /// Consumer name
        consumer: String,
    },
}

impl fmt::Display for DeadLetterOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbox { outbox_id } => write!(f, "outbox#{outbox_id}"),
            Self::Consumer { consumer } => write!(f, "consumer:{consumer}"),
        }
    }
}

/// A message that could not be delivered or processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Failure site
    pub origin: DeadLetterOrigin,
    /// Topic of the message
    pub topic: String,
    /// Message key
    pub key: String,
    /// Raw message bytes
    pub payload: Vec<u8>,
    /// Last error
    pub error: String,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Time of giving up
    pub failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter.
    ///
    /// # Errors
    ///
    /// [`DeadLetterError::Storage`] when the letter could not be stored; the
    /// caller must then keep the message alive (nack or keep pending).
    fn dead_letter(&self, letter: DeadLetter) -> BoxFuture<'_, Result<(), DeadLetterError>>;

    /// Number of letters awaiting inspection.
    ///
    /// # Errors
    ///
    /// [`DeadLetterError::Storage`] on storage failure.
    fn pending_count(&self) -> BoxFuture<'_, Result<u64, DeadLetterError>>;
}
