//! # WattWise Core
//!
//! Shared vocabulary of the WattWise event pipeline.
//!
//! Every owned entity change is written together with a [`event::DomainEvent`]
//! into a transactional outbox, forwarded to a keyed transport, and consumed by
//! independent workers that derive further state (goal achievement, unread
//! notifications, achievements). This crate holds the pieces all of them share:
//!
//! - [`event`]: the event envelope and the entity-to-topic mapping
//! - [`event_bus`]: the keyed, acknowledged transport abstraction
//! - [`model`]: domain entities with guarded state transitions
//! - [`store`]: the record store and outbox ports
//! - [`ledger`]: the per-consumer sequence ledger used for deduplication
//! - [`dead_letter`]: the dead-letter sink port
//! - [`error`]: the pipeline-wide error taxonomy
//! - [`environment`]: injected dependencies such as the clock
//!
//! The crate is free of I/O. Concrete adapters live in `wattwise-postgres`,
//! `wattwise-redpanda` and `wattwise-testing`.

// Re-export commonly used types
pub use chrono::{DateTime, NaiveDate, Utc};

use std::future::Future;
use std::pin::Pin;

pub mod dead_letter;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod ledger;
pub mod model;
pub mod store;

/// Boxed, sendable future returned by the dyn-compatible port traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Handlers stamp achievements, notifications and read markers with the
    /// injected clock so tests can pin time and move it across goal windows.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock implementation used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
