//! # WattWise Runtime
//!
//! Moving parts of the event pipeline, independent of any particular
//! database or broker:
//!
//! - [`outbox::OutboxPublisher`]: commits a change together with its events
//!   and relays pending outbox rows to the transport in per-entity order
//! - [`dispatcher::Dispatcher`]: per-consumer deduplication through the
//!   sequence ledger, handler fan-out, retry ceiling and dead-lettering
//! - [`consumer::ConsumerWorker`]: subscribe-process-reconnect loop that
//!   feeds a dispatcher and settles every delivery
//! - [`dead_letter::DeadLetterQueue`]: bounded in-memory dead-letter sink
//! - [`health::PipelineHealth`]: outbox backlog and dead-letter report
//! - [`retry::RetryPolicy`]: capped exponential backoff
//!
//! ## Example
//!
//! ```ignore
//! let dispatcher = Arc::new(
//!     Dispatcher::new("goal-evaluator", ledger, dead_letters, clock)
//!         .with_handler(EntityType::ConsumptionRecord, evaluator),
//! );
//! let handle = ConsumerWorker::new(dispatcher, bus, shutdown_rx).spawn();
//! ```

/// Consumer worker loop
pub mod consumer;

/// Bounded in-memory dead-letter queue
pub mod dead_letter;

/// Deduplicating handler dispatch
pub mod dispatcher;

/// Health reporting
pub mod health;

/// Prometheus exporter and metric names
pub mod metrics;

/// Transactional outbox publisher and relay
pub mod outbox;

/// Retry logic with exponential backoff
pub mod retry;

pub use consumer::ConsumerWorker;
pub use dead_letter::DeadLetterQueue;
pub use dispatcher::{Dispatcher, Disposition, EventHandler, HandlerError};
pub use health::{HealthCheck, HealthReport, HealthStatus, PipelineHealth};
pub use outbox::{OutboxConfig, OutboxPublisher, SweepReport};
pub use retry::RetryPolicy;
