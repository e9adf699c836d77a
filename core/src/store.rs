//! Record store and outbox ports.
//!
//! A [`Change`] is one single-entity write. [`RecordStore::commit`] applies it
//! and appends the resulting [`DomainEvent`]s to the outbox in the same
//! transaction, allocating each event's per-entity sequence there as well.
//! The outbox relay later drains pending rows through [`OutboxStore`].
//!
//! Commit semantics per change:
//!
//! | Change | Events | Unchanged when |
//! |--------|--------|----------------|
//! | `RegisterUser` | user created | never |
//! | `DeleteUser` | user deleted (cascades owned rows) | never |
//! | `RegisterDevice` | device created | never |
//! | `DeleteDevice` | device deleted (cascades records) | never |
//! | `LogConsumption` | consumption-record created | never |
//! | `CreateGoal` | goal created | never |
//! | `AchieveGoal` | goal updated (`goal-achieved`) | goal already achieved or missed |
//! | `MissGoal` | goal updated (`goal-missed`) | goal already achieved or missed |
//! | `CreateNotification` | notification created | source already notified |
//! | `MarkNotificationRead` | notification updated (`notification-read`) | already read |
//! | `UnlockAchievement` | achievement created, user updated (`score-raised`) | `(user, rule)` exists |
//! | `SetTariffFlag` | tariff-flag created or updated (`tier-changed`) | same tier already set |
//!
//! A change naming a missing entity fails with [`StoreError::NotFound`].

use crate::event::{DomainEvent, EntityType, Topic};
use crate::model::{
    Achievement, ConsumptionRecord, ConsumptionRecordId, Device, DeviceCategory, DeviceId, Goal,
    GoalId, GoalWindow, Kwh, Notification, NotificationId, NotificationSource, RuleId, TariffFlag,
    TariffTier, User, UserId,
};
use crate::{BoxFuture, DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Errors raised by store adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Referenced entity does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type
        entity: EntityType,
        /// Entity id
        id: i64,
    },

    /// Database rejected or lost the operation
    #[error("Database error: {0}")]
    Database(String),

    /// Stored row or event could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// One single-entity write.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Insert a user
    RegisterUser {
        /// Display name
        name: String,
        /// Contact address
        email: String,
        /// Registration time
        at: DateTime<Utc>,
    },
    /// Delete a user and everything it owns
    DeleteUser {
        /// User to delete
        user_id: UserId,
        /// Deletion time
        at: DateTime<Utc>,
    },
    /// Insert a device for a user
    RegisterDevice {
        /// Owner
        user_id: UserId,
        /// Display name
        name: String,
        /// Nameplate power draw
        rated_power_watts: u32,
        /// Category
        category: DeviceCategory,
        /// Registration time
        at: DateTime<Utc>,
    },
    /// Delete a device and its readings
    DeleteDevice {
        /// Device to delete
        device_id: DeviceId,
        /// Deletion time
        at: DateTime<Utc>,
    },
    /// Insert a reading
    LogConsumption {
        /// Device read
        device_id: DeviceId,
        /// Reading timestamp
        recorded_at: DateTime<Utc>,
        /// Energy used
        kwh: Kwh,
        /// Commit time
        at: DateTime<Utc>,
    },
    /// Insert a pending goal
    CreateGoal {
        /// Owner
        user_id: UserId,
        /// Target
        target_kwh: Kwh,
        /// Window
        window: GoalWindow,
        /// Creation time
        at: DateTime<Utc>,
    },
    /// Conditional `Pending → Achieved`
    AchieveGoal {
        /// Goal to achieve
        goal_id: GoalId,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// Conditional `Pending → Missed`
    MissGoal {
        /// Goal whose window closed unmet
        goal_id: GoalId,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// Insert an unread notification unless its source already has one
    CreateNotification {
        /// Addressee
        user_id: UserId,
        /// Text
        message: String,
        /// Triggering event and recipient
        source: NotificationSource,
        /// Creation time
        at: DateTime<Utc>,
    },
    /// Conditional `Unread → Read`
    MarkNotificationRead {
        /// Notification to mark
        notification_id: NotificationId,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// Insert `(user, rule)` if absent and raise the user's score
    UnlockAchievement {
        /// Owner
        user_id: UserId,
        /// Rule satisfied
        rule: RuleId,
        /// Title
        title: String,
        /// Description
        description: String,
        /// Points added to the score
        points: u32,
        /// Unlock time
        at: DateTime<Utc>,
    },
    /// Upsert the tier for a date
    SetTariffFlag {
        /// Tier
        tier: TariffTier,
        /// Date
        effective_on: NaiveDate,
        /// Change time
        at: DateTime<Utc>,
    },
}

impl Change {
    /// Entity type this change writes.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::RegisterUser { .. } | Self::DeleteUser { .. } => EntityType::User,
            Self::RegisterDevice { .. } | Self::DeleteDevice { .. } => EntityType::Device,
            Self::LogConsumption { .. } => EntityType::ConsumptionRecord,
            Self::CreateGoal { .. } | Self::AchieveGoal { .. } | Self::MissGoal { .. } => {
                EntityType::Goal
            }
            Self::CreateNotification { .. } | Self::MarkNotificationRead { .. } => {
                EntityType::Notification
            }
            Self::UnlockAchievement { .. } => EntityType::Achievement,
            Self::SetTariffFlag { .. } => EntityType::TariffFlag,
        }
    }

    /// Commit time carried by the change; stamped on its events.
    #[must_use]
    pub const fn at(&self) -> DateTime<Utc> {
        match self {
            Self::RegisterUser { at, .. }
            | Self::DeleteUser { at, .. }
            | Self::RegisterDevice { at, .. }
            | Self::DeleteDevice { at, .. }
            | Self::LogConsumption { at, .. }
            | Self::CreateGoal { at, .. }
            | Self::AchieveGoal { at, .. }
            | Self::MissGoal { at, .. }
            | Self::CreateNotification { at, .. }
            | Self::MarkNotificationRead { at, .. }
            | Self::UnlockAchievement { at, .. }
            | Self::SetTariffFlag { at, .. } => *at,
        }
    }
}

/// Result of a commit.
#[derive(Clone, Debug, PartialEq)]
pub enum CommitOutcome {
    /// The write happened; these outbox rows were appended with it
    Applied(Vec<OutboxEntry>),
    /// A conditional write found nothing to do
    Unchanged,
}

impl CommitOutcome {
    /// Whether the write happened.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Outbox rows appended by the commit.
    #[must_use]
    pub fn entries(&self) -> &[OutboxEntry] {
        match self {
            Self::Applied(entries) => entries,
            Self::Unchanged => &[],
        }
    }

    /// Event of the entity the change targeted (the first appended).
    #[must_use]
    pub fn primary_event(&self) -> Option<&DomainEvent> {
        self.entries().first().map(|entry| &entry.event)
    }
}

/// Forwarding state of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Not yet confirmed by the transport
    Pending,
    /// Confirmed by the transport
    Forwarded,
    /// Gave up after the sweep attempt ceiling
    DeadLettered,
}

impl OutboxStatus {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Forwarded => "forwarded",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// One row of the transactional outbox.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    /// Row id, ascending in commit order
    pub id: i64,
    /// Event to forward
    pub event: DomainEvent,
    /// Failed forwarding attempts so far
    pub attempts: u32,
    /// Forwarding state
    pub status: OutboxStatus,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Destination topic.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.event.topic()
    }
}

/// Authoritative records plus the transactional write path.
///
/// Lookups return `Ok(None)` for missing rows; the handlers treat a missing
/// referenced entity as a benign no-op (it was deleted by a cascade).
pub trait RecordStore: Send + Sync {
    /// Apply `change` and append its events to the outbox atomically.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for missing referenced entities,
    /// [`StoreError::Database`] when the transaction fails.
    fn commit(&self, change: Change) -> BoxFuture<'_, Result<CommitOutcome, StoreError>>;

    /// Look up a user.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn user(&self, id: UserId) -> BoxFuture<'_, Result<Option<User>, StoreError>>;

    /// Look up a device.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn device(&self, id: DeviceId) -> BoxFuture<'_, Result<Option<Device>, StoreError>>;

    /// All devices owned by a user.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn devices_of(&self, user: UserId) -> BoxFuture<'_, Result<Vec<Device>, StoreError>>;

    /// Look up a consumption record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn consumption_record(
        &self,
        id: ConsumptionRecordId,
    ) -> BoxFuture<'_, Result<Option<ConsumptionRecord>, StoreError>>;

    /// Sum of readings of `devices` with `recorded_at` inside `window`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn consumption_between(
        &self,
        devices: Vec<DeviceId>,
        window: GoalWindow,
    ) -> BoxFuture<'_, Result<Kwh, StoreError>>;

    /// Number of readings across all of a user's devices.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn count_consumption_records(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>>;

    /// Look up a goal.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn goal(&self, id: GoalId) -> BoxFuture<'_, Result<Option<Goal>, StoreError>>;

    /// All goals of a user, oldest first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn goals_of(&self, user: UserId) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>>;

    /// Pending goals of `user` whose window contains `at`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn pending_goals_containing(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>>;

    /// Pending goals of every user whose window closed before `now`.
    /// Achieved and missed goals are settled and never returned.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn pending_goals_closed_by(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>>;

    /// Number of achieved goals of a user.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn count_achieved_goals(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>>;

    /// Look up a notification.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn notification(
        &self,
        id: NotificationId,
    ) -> BoxFuture<'_, Result<Option<Notification>, StoreError>>;

    /// Notifications of a user, newest first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn notifications_of(&self, user: UserId)
    -> BoxFuture<'_, Result<Vec<Notification>, StoreError>>;

    /// Unread notifications of a user.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn count_unread(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>>;

    /// Achievements of a user.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn achievements_of(&self, user: UserId)
    -> BoxFuture<'_, Result<Vec<Achievement>, StoreError>>;

    /// Look up the flag for a date.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn tariff_flag(&self, on: NaiveDate) -> BoxFuture<'_, Result<Option<TariffFlag>, StoreError>>;

    /// Every registered user.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn active_users(&self) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>>;
}

/// Relay side of the outbox.
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending rows in commit order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxEntry>, StoreError>>;

    /// Mark a row as confirmed by the transport.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn mark_forwarded(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Record a failed forwarding attempt; returns the new attempt count.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure or an unknown row.
    fn record_failure(&self, id: i64, error: String) -> BoxFuture<'_, Result<u32, StoreError>>;

    /// Stop forwarding a row.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn mark_dead_lettered(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Number of pending rows.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on storage failure.
    fn count_pending(&self) -> BoxFuture<'_, Result<u64, StoreError>>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::event::EventKind;
    use chrono::TimeZone;

    fn entry(id: i64) -> OutboxEntry {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        OutboxEntry {
            id,
            event: DomainEvent::from_snapshot(
                EntityType::Goal,
                3,
                EventKind::Created,
                1,
                &serde_json::json!({}),
                at,
            )
            .unwrap(),
            attempts: 0,
            status: OutboxStatus::Pending,
            created_at: at,
        }
    }

    #[test]
    fn change_targets_its_entity_type() {
        let change = Change::AchieveGoal {
            goal_id: GoalId::new(1),
            at: Utc::now(),
        };
        assert_eq!(change.entity_type(), EntityType::Goal);
        let miss = Change::MissGoal { goal_id: GoalId::new(1), at: Utc::now() };
        assert_eq!(miss.entity_type(), EntityType::Goal);
        let at = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let delete = Change::DeleteDevice { device_id: DeviceId::new(2), at };
        assert_eq!(delete.entity_type(), EntityType::Device);
        assert_eq!(delete.at(), at);
    }

    #[test]
    fn commit_outcome_exposes_primary_event() {
        let applied = CommitOutcome::Applied(vec![entry(1), entry(2)]);
        assert!(applied.is_applied());
        assert_eq!(applied.primary_event().unwrap().entity_id, 3);
        assert_eq!(applied.entries()[0].topic(), Topic::Goal);

        assert!(CommitOutcome::Unchanged.entries().is_empty());
        assert!(CommitOutcome::Unchanged.primary_event().is_none());
    }

    #[test]
    fn only_database_errors_are_transient() {
        assert!(StoreError::Database("timeout".to_string()).is_transient());
        assert!(!StoreError::NotFound { entity: EntityType::User, id: 1 }.is_transient());
    }
}
