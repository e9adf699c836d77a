//! Achievement unlocker.
//!
//! Every qualifying event re-counts the owner's progress from the
//! authoritative records and tries to unlock each rule whose milestone has
//! been reached. Unlocking is one insert-if-absent write that also raises the
//! owner's savings score, so a rule unlocks at most once per user even when
//! duplicate deliveries race.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::event::{ChangeTag, DomainEvent, EntityType, EventKind};
use wattwise_core::model::{ConsumptionRecord, Goal, RuleId, UserId};
use wattwise_core::store::{Change, RecordStore};
use wattwise_runtime::{EventHandler, HandlerError, OutboxPublisher};

/// Consumer name of the achievement unlocker.
pub const ACHIEVEMENT_UNLOCKER: &str = "achievement-unlocker";

/// Progress a rule is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// Number of achieved goals
    GoalsAchieved(u64),
    /// Number of consumption records across all devices
    RecordsLogged(u64),
}

/// One unlockable achievement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AchievementRule {
    /// Stable identifier, unique per user once unlocked
    pub id: &'static str,
    /// Title shown to the user
    pub title: &'static str,
    /// Description shown to the user
    pub description: &'static str,
    /// Points added to the savings score
    pub points: u32,
    /// Condition
    pub milestone: Milestone,
}

/// Rules unlocked by the pipeline.
pub const RULES: &[AchievementRule] = &[
    AchievementRule {
        id: "goals-achieved-3",
        title: "Hat Trick",
        description: "Achieve three savings goals",
        points: 50,
        milestone: Milestone::GoalsAchieved(3),
    },
    AchievementRule {
        id: "goals-achieved-10",
        title: "Energy Saver",
        description: "Achieve ten savings goals",
        points: 200,
        milestone: Milestone::GoalsAchieved(10),
    },
    AchievementRule {
        id: "consumption-logged-10",
        title: "Keeping Track",
        description: "Log ten consumption readings",
        points: 10,
        milestone: Milestone::RecordsLogged(10),
    },
    AchievementRule {
        id: "consumption-logged-100",
        title: "Meter Reader",
        description: "Log one hundred consumption readings",
        points: 100,
        milestone: Milestone::RecordsLogged(100),
    },
];

/// Unlocks achievements from goal and consumption events.
pub struct AchievementUnlocker {
    publisher: OutboxPublisher,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    rules: &'static [AchievementRule],
}

impl AchievementUnlocker {
    /// Unlocker for [`RULES`].
    #[must_use]
    pub fn new(
        publisher: OutboxPublisher,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher,
            records,
            clock,
            rules: RULES,
        }
    }

    /// Replace the rule catalogue.
    #[must_use]
    pub const fn with_rules(mut self, rules: &'static [AchievementRule]) -> Self {
        self.rules = rules;
        self
    }

    /// Unlock every goal-count rule `user` has reached. Returns how many
    /// were unlocked by this call.
    ///
    /// # Errors
    ///
    /// Store failures while counting or writing.
    pub async fn on_goal_achieved(&self, user: UserId) -> Result<usize, PipelineError> {
        let achieved = self.records.count_achieved_goals(user).await?;
        self.unlock_reached(user, |milestone| {
            matches!(milestone, Milestone::GoalsAchieved(n) if achieved >= n)
        })
        .await
    }

    /// Unlock every record-count rule the owner of `record` has reached.
    ///
    /// # Errors
    ///
    /// Store failures while counting or writing.
    pub async fn on_consumption(&self, record: &ConsumptionRecord) -> Result<usize, PipelineError> {
        let Some(device) = self.records.device(record.device_id).await? else {
            return Ok(0);
        };
        let logged = self.records.count_consumption_records(device.user_id).await?;
        self.unlock_reached(device.user_id, |milestone| {
            matches!(milestone, Milestone::RecordsLogged(n) if logged >= n)
        })
        .await
    }

    async fn unlock_reached(
        &self,
        user: UserId,
        reached: impl Fn(Milestone) -> bool,
    ) -> Result<usize, PipelineError> {
        let mut unlocked = 0;
        for rule in self.rules.iter().filter(|rule| reached(rule.milestone)) {
            if self.unlock(user, rule).await? {
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }

    async fn unlock(&self, user: UserId, rule: &AchievementRule) -> Result<bool, PipelineError> {
        let change = Change::UnlockAchievement {
            user_id: user,
            rule: RuleId::new(rule.id),
            title: rule.title.to_string(),
            description: rule.description.to_string(),
            points: rule.points,
            at: self.clock.now(),
        };
        match self.publisher.publish(change).await {
            Ok(outcome) if outcome.is_applied() => {
                info!(%user, rule = rule.id, points = rule.points, "Achievement unlocked");
                Ok(true)
            }
            Ok(_) => {
                debug!(%user, rule = rule.id, "Achievement already unlocked");
                Ok(false)
            }
            Err(PipelineError::NotFound { .. }) => {
                debug!(%user, rule = rule.id, "User deleted, skipping achievement");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EventHandler for AchievementUnlocker {
    fn name(&self) -> &'static str {
        ACHIEVEMENT_UNLOCKER
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let permanent = |e: wattwise_core::event::EventError| HandlerError::Permanent(e.to_string());
        match event.entity_type {
            EntityType::Goal if event.is_update(ChangeTag::GoalAchieved) => {
                let goal: Goal = event.snapshot().map_err(permanent)?;
                self.on_goal_achieved(goal.user_id).await?;
            }
            EntityType::ConsumptionRecord if event.kind == EventKind::Created => {
                let record: ConsumptionRecord = event.snapshot().map_err(permanent)?;
                self.on_consumption(&record).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Debug for AchievementUnlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AchievementUnlocker")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}
