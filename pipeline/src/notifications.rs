//! Notification dispatcher.
//!
//! Turns goal achievements, unlocked achievements and tariff changes into
//! unread notifications. Each notification remembers the event and recipient
//! it was created for, and the store inserts it only if that source has no
//! notification yet, so redelivery never duplicates one.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use wattwise_core::BoxFuture;
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::event::{ChangeTag, DomainEvent, EntityType, EventKind};
use wattwise_core::model::{Achievement, Goal, NotificationSource, TariffFlag, UserId};
use wattwise_core::store::{Change, RecordStore, StoreError};
use wattwise_runtime::{EventHandler, HandlerError, OutboxPublisher};

/// Consumer name of the notification dispatcher.
pub const NOTIFICATION_DISPATCHER: &str = "notification-dispatcher";

/// Who receives broadcast notifications such as tariff changes.
pub trait SubscriberDirectory: Send + Sync {
    /// Users that should receive broadcasts.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the directory cannot be read.
    fn active_users(&self) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>>;
}

/// Directory listing every registered user.
#[derive(Clone)]
pub struct StoreSubscriberDirectory {
    records: Arc<dyn RecordStore>,
}

impl StoreSubscriberDirectory {
    /// Directory over `records`.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

impl SubscriberDirectory for StoreSubscriberDirectory {
    fn active_users(&self) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>> {
        self.records.active_users()
    }
}

fn goal_message(goal: &Goal) -> String {
    format!(
        "Goal reached: {} target for {} to {}.",
        goal.target_kwh,
        goal.window.start().format("%Y-%m-%d"),
        goal.window.end().format("%Y-%m-%d"),
    )
}

fn achievement_message(achievement: &Achievement) -> String {
    format!(
        "Achievement unlocked: {} (+{} points).",
        achievement.title, achievement.points
    )
}

fn tariff_message(flag: &TariffFlag) -> String {
    format!(
        "Tariff for {} is {}: {}.",
        flag.effective_on,
        flag.tier,
        flag.tier.description()
    )
}

/// Creates notifications from domain events.
pub struct NotificationDispatcher {
    publisher: OutboxPublisher,
    directory: Arc<dyn SubscriberDirectory>,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    /// Dispatcher broadcasting to `directory`.
    #[must_use]
    pub fn new(
        publisher: OutboxPublisher,
        directory: Arc<dyn SubscriberDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher,
            directory,
            clock,
        }
    }

    /// Create the notifications `event` calls for. Returns how many were
    /// created by this call.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Serialization`] for a payload that does not match
    /// its entity type, store failures otherwise.
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<usize, PipelineError> {
        match event.entity_type {
            EntityType::Goal if event.is_update(ChangeTag::GoalAchieved) => {
                let goal: Goal = event.snapshot()?;
                self.notify(event, goal.user_id, goal_message(&goal)).await
            }
            EntityType::Achievement if event.kind == EventKind::Created => {
                let achievement: Achievement = event.snapshot()?;
                self.notify(event, achievement.user_id, achievement_message(&achievement))
                    .await
            }
            EntityType::TariffFlag
                if event.kind == EventKind::Created || event.is_update(ChangeTag::TierChanged) =>
            {
                let flag: TariffFlag = event.snapshot()?;
                let message = tariff_message(&flag);
                let users = self.directory.active_users().await?;
                let mut created = 0;
                for user in users {
                    created += self.notify(event, user, message.clone()).await?;
                }
                info!(tier = %flag.tier, date = %flag.effective_on, created, "Tariff change broadcast");
                Ok(created)
            }
            _ => Ok(0),
        }
    }

    async fn notify(
        &self,
        event: &DomainEvent,
        user: UserId,
        message: String,
    ) -> Result<usize, PipelineError> {
        let source = NotificationSource::new(event.key(), user);
        let change = Change::CreateNotification {
            user_id: user,
            message,
            source,
            at: self.clock.now(),
        };
        match self.publisher.publish(change).await {
            Ok(outcome) if outcome.is_applied() => {
                debug!(%user, source = %source.dedup_key(), "Notification created");
                Ok(1)
            }
            Ok(_) => {
                debug!(%user, source = %source.dedup_key(), "Notification already exists");
                Ok(0)
            }
            Err(PipelineError::NotFound { .. }) => {
                debug!(%user, "Recipient deleted, skipping notification");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EventHandler for NotificationDispatcher {
    fn name(&self) -> &'static str {
        NOTIFICATION_DISPATCHER
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        self.dispatch(event).await?;
        Ok(())
    }
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use wattwise_core::model::{
        AchievementId, GoalId, GoalState, GoalWindow, Kwh, RuleId, TariffFlagId, TariffTier,
    };

    #[test]
    fn messages_describe_their_trigger() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let goal = Goal {
            id: GoalId::new(1),
            user_id: UserId::new(1),
            target_kwh: Kwh::new(100.0).unwrap(),
            window: GoalWindow::new(start, start + chrono::Duration::days(7)).unwrap(),
            state: GoalState::Achieved { at: start },
            created_at: start,
        };
        assert_eq!(
            goal_message(&goal),
            "Goal reached: 100.00 kWh target for 2025-01-01 to 2025-01-08."
        );

        let achievement = Achievement {
            id: AchievementId::new(1),
            user_id: UserId::new(1),
            rule: RuleId::new("goals-achieved-3"),
            title: "Hat Trick".to_string(),
            description: "Achieve three savings goals".to_string(),
            points: 50,
            unlocked_at: start,
        };
        assert_eq!(achievement_message(&achievement), "Achievement unlocked: Hat Trick (+50 points).");

        let flag = TariffFlag {
            id: TariffFlagId::new(1),
            tier: TariffTier::Red1,
            effective_on: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            updated_at: start,
        };
        assert!(tariff_message(&flag).starts_with("Tariff for 2025-01-02 is RED_1"));
    }
}
