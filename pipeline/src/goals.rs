//! Goal evaluator.
//!
//! Reacts to new consumption records. For each pending goal of the record's
//! owner whose window contains the reading, it re-sums the owner's
//! consumption over the whole window and compares it with the target. The
//! sum is a range aggregation over the authoritative records, so evaluating
//! the same goal twice gives the same answer and redelivery is harmless.
//!
//! Achieving a goal is a conditional write (`Pending → Achieved` only); the
//! resulting `goal updated (goal-achieved)` event is emitted exactly once no
//! matter how many deliveries race on it.
//!
//! Under [`GoalComparison::Ceiling`] a goal can only be decided once its
//! window has closed, which a reading inside the window never observes.
//! [`GoalEvaluator::evaluate_closed_windows`] settles those goals and runs
//! periodically through [`GoalEvaluator::spawn_sweeper`]. A goal whose window
//! closed unmet moves to `Missed` (`goal-missed`), so each goal is summed by
//! the sweep at most once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::event::{DomainEvent, EntityType, EventKind};
use wattwise_core::model::{ConsumptionRecord, Goal, GoalWindow, Kwh, ValidationError};
use wattwise_core::store::{Change, RecordStore};
use wattwise_core::{DateTime, Utc};
use wattwise_runtime::{EventHandler, HandlerError, OutboxPublisher};

/// Consumer name of the goal evaluator.
pub const GOAL_EVALUATOR: &str = "goal-evaluator";

/// How window consumption is compared with a goal's target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalComparison {
    /// Stay at or below the target; decided when the window closes
    #[default]
    Ceiling,
    /// Reach the target; decided as soon as the total gets there
    Threshold,
}

impl GoalComparison {
    /// Whether a goal with `target` over `window` is met by `total` at `now`.
    #[must_use]
    pub fn is_met(self, total: Kwh, target: Kwh, window: &GoalWindow, now: DateTime<Utc>) -> bool {
        match self {
            Self::Ceiling => window.has_closed(now) && total.value() <= target.value(),
            Self::Threshold => total.value() >= target.value(),
        }
    }

    /// Configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ceiling => "ceiling",
            Self::Threshold => "threshold",
        }
    }
}

impl fmt::Display for GoalComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GoalComparison {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ceiling" => Ok(Self::Ceiling),
            "threshold" => Ok(Self::Threshold),
            _ => Err(ValidationError::Unknown {
                kind: "goal comparison",
                value: s.to_string(),
            }),
        }
    }
}

/// Decides goal achievement from consumption records.
pub struct GoalEvaluator {
    publisher: OutboxPublisher,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    comparison: GoalComparison,
}

impl GoalEvaluator {
    /// Evaluator with [`GoalComparison::Ceiling`].
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
            comparison: GoalComparison::default(),
        }
    }

    /// Use `comparison` instead of the default.
    #[must_use]
    pub const fn with_comparison(mut self, comparison: GoalComparison) -> Self {
        self.comparison = comparison;
        self
    }

    /// Active comparison.
    #[must_use]
    pub const fn comparison(&self) -> GoalComparison {
        self.comparison
    }

    /// Evaluate the goals a new reading can affect. Returns how many were
    /// achieved by this call.
    ///
    /// A reading whose device no longer exists, or that falls outside every
    /// pending window, changes nothing.
    ///
    /// # Errors
    ///
    /// Store failures while reading or writing.
    pub async fn on_consumption(&self, record: &ConsumptionRecord) -> Result<usize, PipelineError> {
        let Some(device) = self.records.device(record.device_id).await? else {
            debug!(device = %record.device_id, record = %record.id, "Device gone, skipping reading");
            return Ok(0);
        };

        let goals = self
            .records
            .pending_goals_containing(device.user_id, record.recorded_at)
            .await?;
        if goals.is_empty() {
            debug!(record = %record.id, user = %device.user_id, "Reading outside every open goal window");
            return Ok(0);
        }

        let now = self.clock.now();
        let mut achieved = 0;
        for goal in &goals {
            if self.evaluate(goal, now).await? == Verdict::Achieved {
                achieved += 1;
            }
        }
        Ok(achieved)
    }

    /// Settle pending goals whose window closed before `now`. Each goal ends
    /// up achieved or missed; returns how many were achieved.
    ///
    /// # Errors
    ///
    /// Store failures while reading or writing.
    pub async fn evaluate_closed_windows(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let goals = self.records.pending_goals_closed_by(now).await?;
        if goals.is_empty() {
            debug!("No closed goal windows to settle");
            return Ok(0);
        }
        let mut achieved = 0;
        let mut missed = 0;
        for goal in &goals {
            match self.evaluate(goal, now).await? {
                Verdict::Achieved => achieved += 1,
                Verdict::Missed => missed += 1,
                Verdict::Open => {}
            }
        }
        info!(checked = goals.len(), achieved, missed, "Closed goal windows settled");
        Ok(achieved)
    }

    /// Run [`GoalEvaluator::evaluate_closed_windows`] every `interval` until
    /// `shutdown` fires.
    #[must_use]
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Goal window sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.evaluate_closed_windows(self.clock.now()).await {
                    error!(error = %e, "Goal window sweep failed");
                }
            }
            info!("Goal window sweeper stopped");
        })
    }

    async fn evaluate(&self, goal: &Goal, now: DateTime<Utc>) -> Result<Verdict, PipelineError> {
        let devices: Vec<_> = self
            .records
            .devices_of(goal.user_id)
            .await?
            .into_iter()
            .map(|device| device.id)
            .collect();
        let total = if devices.is_empty() {
            Kwh::ZERO
        } else {
            self.records.consumption_between(devices, goal.window).await?
        };

        if self.comparison.is_met(total, goal.target_kwh, &goal.window, now) {
            let change = Change::AchieveGoal {
                goal_id: goal.id,
                at: now,
            };
            if self.settle(goal, change).await? {
                info!(goal = %goal.id, user = %goal.user_id, %total, "Goal achieved");
                return Ok(Verdict::Achieved);
            }
            return Ok(Verdict::Open);
        }

        if !goal.window.has_closed(now) {
            debug!(goal = %goal.id, %total, target = %goal.target_kwh, "Goal not met yet");
            return Ok(Verdict::Open);
        }

        let change = Change::MissGoal {
            goal_id: goal.id,
            at: now,
        };
        if self.settle(goal, change).await? {
            debug!(goal = %goal.id, %total, target = %goal.target_kwh, "Goal missed");
            return Ok(Verdict::Missed);
        }
        Ok(Verdict::Open)
    }

    /// Publish a settling change. `false` when the goal was already settled
    /// or deleted meanwhile.
    async fn settle(&self, goal: &Goal, change: Change) -> Result<bool, PipelineError> {
        match self.publisher.publish(change).await {
            Ok(outcome) if outcome.is_applied() => Ok(true),
            Ok(_) => {
                debug!(goal = %goal.id, "Goal was already settled");
                Ok(false)
            }
            Err(PipelineError::NotFound { .. }) => {
                debug!(goal = %goal.id, "Goal deleted before it could be settled");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// What one evaluation did to a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Open,
    Achieved,
    Missed,
}

#[async_trait]
impl EventHandler for GoalEvaluator {
    fn name(&self) -> &'static str {
        GOAL_EVALUATOR
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        if event.entity_type != EntityType::ConsumptionRecord || event.kind != EventKind::Created {
            return Ok(());
        }
        let record: ConsumptionRecord = event
            .snapshot()
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
        self.on_consumption(&record).await?;
        Ok(())
    }
}

impl fmt::Debug for GoalEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalEvaluator")
            .field("comparison", &self.comparison)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::{Duration as Days, TimeZone};
    use proptest::prelude::*;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    fn kwh(value: f64) -> Kwh {
        Kwh::new(value).unwrap()
    }

    #[test]
    fn ceiling_waits_for_the_window_to_close() {
        let window = GoalWindow::new(t(1), t(8)).unwrap();
        let ceiling = GoalComparison::Ceiling;
        assert!(!ceiling.is_met(kwh(50.0), kwh(100.0), &window, t(5)));
        assert!(!ceiling.is_met(kwh(100.0), kwh(100.0), &window, t(8)));
        assert!(ceiling.is_met(kwh(100.0), kwh(100.0), &window, t(9)));
        assert!(!ceiling.is_met(kwh(100.5), kwh(100.0), &window, t(9)));
    }

    #[test]
    fn threshold_flips_when_reached() {
        let window = GoalWindow::new(t(1), t(8)).unwrap();
        let threshold = GoalComparison::Threshold;
        assert!(!threshold.is_met(kwh(40.0), kwh(100.0), &window, t(2)));
        assert!(threshold.is_met(kwh(110.0), kwh(100.0), &window, t(3)));
    }

    #[test]
    fn comparison_names_parse() {
        assert_eq!("Threshold".parse::<GoalComparison>().unwrap(), GoalComparison::Threshold);
        assert_eq!(GoalComparison::Ceiling.to_string(), "ceiling");
        assert!("floor".parse::<GoalComparison>().is_err());
    }

    proptest! {
        #[test]
        fn ceiling_never_met_inside_the_window(total in 0.0f64..1000.0, offset in 0i64..=7) {
            let window = GoalWindow::new(t(1), t(8)).unwrap();
            let now = t(1) + Days::days(offset);
            prop_assert!(!GoalComparison::Ceiling.is_met(kwh(total), kwh(100.0), &window, now));
        }
    }
}
