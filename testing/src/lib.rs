//! # WattWise Testing
//!
//! In-memory doubles for the ports defined in `wattwise-core`, so the outbox
//! publisher, dispatcher and handlers can be exercised without Postgres or a
//! broker:
//!
//! - [`InMemoryEventBus`]: per-topic logs with consumer-group cursors, manual
//!   ack/nack and publish failure injection
//! - [`InMemoryRecordStore`]: transactional record store and outbox behind a
//!   single lock
//! - [`InMemorySequenceLedger`]: dedup ledger with compare-and-advance
//! - [`FixedClock`]: deterministic, manually advanced time
//!
//! ## Example
//!
//! ```ignore
//! use wattwise_testing::{InMemoryEventBus, InMemoryRecordStore, test_clock};
//!
//! #[tokio::test]
//! async fn relay_forwards_commits() {
//!     let store = Arc::new(InMemoryRecordStore::new());
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     // build an OutboxPublisher, commit a change, sweep...
//!     assert_eq!(bus.published("consumption").len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use wattwise_core::environment::Clock;

mod event_bus;
mod ledger;
mod record_store;

pub use event_bus::InMemoryEventBus;
pub use ledger::InMemorySequenceLedger;
pub use record_store::InMemoryRecordStore;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Deterministic clock for tests.
    ///
    /// Returns the same instant until moved with [`FixedClock::advance`] or
    /// [`FixedClock::set`]. Clones share the same instant, so a test can keep
    /// one handle and move time under components holding another.
    ///
    /// # Example
    ///
    /// ```
    /// use wattwise_testing::mocks::FixedClock;
    /// use wattwise_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let before = clock.now();
    /// assert_eq!(before, clock.now());
    ///
    /// clock.advance(Duration::days(1));
    /// assert_eq!(clock.now() - before, Duration::days(1));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a clock frozen at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }

        /// Move forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber writing to the test harness output.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
