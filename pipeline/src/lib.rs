//! # WattWise Pipeline
//!
//! The energy tracker's event-driven side. Writes go through
//! [`EnergyService`], which commits each record together with its events;
//! the outbox relay forwards those events and three consumers react to them:
//!
//! - [`GoalEvaluator`]: consumption records to achieved goals
//! - [`AchievementUnlocker`]: achieved goals and readings to achievements and
//!   savings score
//! - [`NotificationDispatcher`]: achieved goals, achievements and tariff
//!   changes to unread notifications
//!
//! [`ReadStateCounter`] marks notifications read and counts unread ones.
//! [`Pipeline`] wires everything from a [`Config`] and a set of adapters.
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = Config::from_env()?;
//! let pipeline = Pipeline::new(dependencies, &config);
//! let running = pipeline.start();
//!
//! let user = pipeline.service().register_user("Ada", "ada@example.com").await?;
//!
//! shutdown_signal().await;
//! running.shutdown().await;
//! ```

/// Rule catalogue and unlocking
pub mod achievements;

/// Wiring and lifecycle
pub mod app;

/// Environment configuration
pub mod config;

/// Goal evaluation
pub mod goals;

/// Notification creation
pub mod notifications;

/// Notification read state
pub mod read_state;

/// Write and read entrypoints
pub mod services;

pub use achievements::{AchievementRule, AchievementUnlocker, Milestone, RULES};
pub use app::{Dependencies, Pipeline, RunningPipeline, shutdown_signal};
pub use config::{Config, ConfigError};
pub use goals::{GoalComparison, GoalEvaluator};
pub use notifications::{NotificationDispatcher, StoreSubscriberDirectory, SubscriberDirectory};
pub use read_state::ReadStateCounter;
pub use services::EnergyService;
