//! `PostgreSQL` adapters for the WattWise event pipeline.
//!
//! - [`PostgresRecordStore`]: authoritative records plus the transactional
//!   outbox. Entity rows, per-entity sequence counters and outbox rows are
//!   written in one transaction.
//! - [`PostgresSequenceLedger`]: the per-consumer dedup ledger.
//! - [`PostgresDeadLetterQueue`]: durable dead letters with operator review.
//!
//! Apply [`MIGRATOR`] before constructing any of them.
//!
//! # Example
//!
//! ```no_run
//! use sqlx::postgres::PgPoolOptions;
//! use wattwise_postgres::{MIGRATOR, PostgresRecordStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPoolOptions::new()
//!     .max_connections(10)
//!     .connect("postgres://localhost/wattwise")
//!     .await?;
//! MIGRATOR.run(&pool).await?;
//! let store = PostgresRecordStore::new(pool);
//! # Ok(())
//! # }
//! ```

mod dead_letter_queue;
mod ledger;
mod store;

pub use dead_letter_queue::{DLQStatus, FailedMessage, PostgresDeadLetterQueue};
pub use ledger::PostgresSequenceLedger;
pub use store::PostgresRecordStore;

/// Schema migrations for every table the adapters use.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
