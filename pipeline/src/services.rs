//! Synchronous entrypoints of the energy tracker.
//!
//! Every write validates its input first, so rejected input never reaches the
//! outbox, and then goes through [`OutboxPublisher::publish`], which commits
//! the record together with its events. Everything downstream (goal
//! evaluation, achievements, notifications) happens asynchronously.

use crate::read_state::ReadStateCounter;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::info;
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::event::EntityType;
use wattwise_core::model::{
    Achievement, ConsumptionRecord, Device, DeviceCategory, DeviceId, Goal, GoalId, GoalWindow, Kwh,
    Notification, NotificationId, TariffFlag, TariffTier, User, UserId, ValidationError,
};
use wattwise_core::store::{Change, CommitOutcome, RecordStore, StoreError};
use wattwise_core::{DateTime, NaiveDate, Utc};
use wattwise_runtime::OutboxPublisher;

/// Snapshot carried by the first event of an applied commit.
fn committed<T: DeserializeOwned>(outcome: &CommitOutcome) -> Result<T, PipelineError> {
    let event = outcome.primary_event().ok_or_else(|| {
        PipelineError::from(StoreError::Serialization(
            "commit appended no event".to_string(),
        ))
    })?;
    Ok(event.snapshot()?)
}

fn non_blank(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank(field));
    }
    Ok(())
}

/// Write and read entrypoints used by the API layer.
#[derive(Clone)]
pub struct EnergyService {
    publisher: OutboxPublisher,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    read_state: ReadStateCounter,
}

impl EnergyService {
    /// Service writing through `publisher` and reading from `records`.
    #[must_use]
    pub fn new(
        publisher: OutboxPublisher,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let read_state = ReadStateCounter::new(publisher.clone(), records.clone(), clock.clone());
        Self {
            publisher,
            records,
            clock,
            read_state,
        }
    }

    /// Register a user.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] for a blank name or email, store
    /// failures otherwise.
    pub async fn register_user(&self, name: &str, email: &str) -> Result<User, PipelineError> {
        non_blank("name", name)?;
        non_blank("email", email)?;
        let outcome = self
            .publisher
            .publish(Change::RegisterUser {
                name: name.trim().to_string(),
                email: email.trim().to_string(),
                at: self.clock.now(),
            })
            .await?;
        let user: User = committed(&outcome)?;
        info!(user = %user.id, "User registered");
        Ok(user)
    }

    /// Delete a user together with its devices, readings, goals,
    /// notifications and achievements.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotFound`] for an unknown user.
    pub async fn delete_user(&self, user: UserId) -> Result<(), PipelineError> {
        self.publisher
            .publish(Change::DeleteUser {
                user_id: user,
                at: self.clock.now(),
            })
            .await?;
        info!(%user, "User deleted");
        Ok(())
    }

    /// Register a device for `user`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] for a blank name,
    /// [`PipelineError::NotFound`] for an unknown user.
    pub async fn register_device(
        &self,
        user: UserId,
        name: &str,
        rated_power_watts: u32,
        category: DeviceCategory,
    ) -> Result<Device, PipelineError> {
        non_blank("name", name)?;
        let outcome = self
            .publisher
            .publish(Change::RegisterDevice {
                user_id: user,
                name: name.trim().to_string(),
                rated_power_watts,
                category,
                at: self.clock.now(),
            })
            .await?;
        let device: Device = committed(&outcome)?;
        info!(%user, device = %device.id, category = category.as_str(), "Device registered");
        Ok(device)
    }

    /// Delete a device and its readings.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotFound`] for an unknown device.
    pub async fn delete_device(&self, device: DeviceId) -> Result<(), PipelineError> {
        self.publisher
            .publish(Change::DeleteDevice {
                device_id: device,
                at: self.clock.now(),
            })
            .await?;
        info!(%device, "Device deleted");
        Ok(())
    }

    /// Record a reading of `kwh` taken at `recorded_at`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] for a negative or non-finite amount,
    /// [`PipelineError::NotFound`] for an unknown device.
    pub async fn log_consumption(
        &self,
        device: DeviceId,
        recorded_at: DateTime<Utc>,
        kwh: f64,
    ) -> Result<ConsumptionRecord, PipelineError> {
        let kwh = Kwh::new(kwh)?;
        let outcome = self
            .publisher
            .publish(Change::LogConsumption {
                device_id: device,
                recorded_at,
                kwh,
                at: self.clock.now(),
            })
            .await?;
        committed(&outcome)
    }

    /// Create a pending goal of at most (or at least, depending on the
    /// configured comparison) `target_kwh` over `[start, end]`, both ends included.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] for a non-positive target or an empty
    /// window, [`PipelineError::NotFound`] for an unknown user.
    pub async fn create_goal(
        &self,
        user: UserId,
        target_kwh: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Goal, PipelineError> {
        if target_kwh.is_finite() && target_kwh <= 0.0 {
            return Err(ValidationError::NonPositiveTarget(target_kwh).into());
        }
        let target_kwh = Kwh::new(target_kwh)?;
        let window = GoalWindow::new(start, end)?;
        let outcome = self
            .publisher
            .publish(Change::CreateGoal {
                user_id: user,
                target_kwh,
                window,
                at: self.clock.now(),
            })
            .await?;
        let goal: Goal = committed(&outcome)?;
        info!(%user, goal = %goal.id, target = %goal.target_kwh, "Goal created");
        Ok(goal)
    }

    /// Set the tariff tier of `effective_on`. Setting the tier already in
    /// effect changes nothing and emits no event.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn set_tariff_flag(
        &self,
        tier: TariffTier,
        effective_on: NaiveDate,
    ) -> Result<TariffFlag, PipelineError> {
        let outcome = self
            .publisher
            .publish(Change::SetTariffFlag {
                tier,
                effective_on,
                at: self.clock.now(),
            })
            .await?;
        if outcome.is_applied() {
            let flag: TariffFlag = committed(&outcome)?;
            info!(%tier, date = %effective_on, "Tariff flag set");
            return Ok(flag);
        }
        self.records
            .tariff_flag(effective_on)
            .await?
            .ok_or(PipelineError::NotFound {
                entity: EntityType::TariffFlag,
                id: 0,
            })
    }

    /// Mark a notification read. Returns whether it was unread.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn mark_read(&self, notification: NotificationId) -> Result<bool, PipelineError> {
        self.read_state.mark_read(notification).await
    }

    /// Unread notifications of `user`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn count_unread(&self, user: UserId) -> Result<u64, PipelineError> {
        self.read_state.count_unread(user).await
    }

    /// Look up a user.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn user(&self, id: UserId) -> Result<Option<User>, PipelineError> {
        Ok(self.records.user(id).await?)
    }

    /// Look up a goal.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn goal(&self, id: GoalId) -> Result<Option<Goal>, PipelineError> {
        Ok(self.records.goal(id).await?)
    }

    /// Goals of `user`, oldest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn goals_of(&self, user: UserId) -> Result<Vec<Goal>, PipelineError> {
        Ok(self.records.goals_of(user).await?)
    }

    /// Notifications of `user`, newest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn notifications_of(&self, user: UserId) -> Result<Vec<Notification>, PipelineError> {
        Ok(self.records.notifications_of(user).await?)
    }

    /// Achievements of `user`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn achievements_of(&self, user: UserId) -> Result<Vec<Achievement>, PipelineError> {
        Ok(self.records.achievements_of(user).await?)
    }

    /// Tariff flag of a date.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn tariff_flag(&self, on: NaiveDate) -> Result<Option<TariffFlag>, PipelineError> {
        Ok(self.records.tariff_flag(on).await?)
    }
}

impl std::fmt::Debug for EnergyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnergyService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Duration;
    use wattwise_core::store::OutboxStore;
    use wattwise_runtime::DeadLetterQueue;
    use wattwise_testing::{InMemoryEventBus, InMemoryRecordStore, test_clock};

    fn service() -> (EnergyService, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let clock = Arc::new(test_clock());
        let publisher = OutboxPublisher::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(DeadLetterQueue::default()),
            clock.clone(),
        );
        (EnergyService::new(publisher, store.clone(), clock), store)
    }

    #[tokio::test]
    async fn rejected_input_never_reaches_the_outbox() {
        let (service, store) = service();
        let user = service.register_user("Ada", "ada@example.com").await.unwrap();
        let device = service
            .register_device(user.id, "Heat pump", 2000, DeviceCategory::Climate)
            .await
            .unwrap();
        let before = store.count_pending().await.unwrap();

        let now = test_clock().now();
        assert!(matches!(
            service.register_user(" ", "x@example.com").await,
            Err(PipelineError::Validation(ValidationError::Blank("name")))
        ));
        assert!(matches!(
            service.log_consumption(device.id, now, -1.0).await,
            Err(PipelineError::Validation(ValidationError::NegativeEnergy(_)))
        ));
        assert!(matches!(
            service.create_goal(user.id, 0.0, now, now + Duration::days(7)).await,
            Err(PipelineError::Validation(ValidationError::NonPositiveTarget(_)))
        ));
        assert!(matches!(
            service.create_goal(user.id, 10.0, now, now).await,
            Err(PipelineError::Validation(ValidationError::EmptyWindow { .. }))
        ));

        assert_eq!(store.count_pending().await.unwrap(), before);
    }

    #[tokio::test]
    async fn writes_against_missing_entities_fail() {
        let (service, _) = service();
        let now = test_clock().now();
        assert!(matches!(
            service.log_consumption(DeviceId::new(42), now, 1.0).await,
            Err(PipelineError::NotFound { entity: EntityType::Device, id: 42 })
        ));
        assert!(matches!(
            service.delete_user(UserId::new(7)).await,
            Err(PipelineError::NotFound { entity: EntityType::User, .. })
        ));
    }

    #[tokio::test]
    async fn setting_the_same_tier_twice_is_quiet() {
        let (service, store) = service();
        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();

        let first = service.set_tariff_flag(TariffTier::Green, day).await.unwrap();
        let again = service.set_tariff_flag(TariffTier::Green, day).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.events_of(EntityType::TariffFlag).len(), 1);

        let raised = service.set_tariff_flag(TariffTier::Red1, day).await.unwrap();
        assert_eq!(raised.tier, TariffTier::Red1);
        assert_eq!(store.events_of(EntityType::TariffFlag).len(), 2);
    }

    #[tokio::test]
    async fn lookups_read_the_records() {
        let (service, _) = service();
        let user = service.register_user("Grace", "grace@example.com").await.unwrap();
        let now = test_clock().now();
        let goal = service
            .create_goal(user.id, 100.0, now, now + Duration::days(7))
            .await
            .unwrap();

        assert_eq!(service.user(user.id).await.unwrap(), Some(user.clone()));
        assert_eq!(service.goal(goal.id).await.unwrap(), Some(goal.clone()));
        assert_eq!(service.goals_of(user.id).await.unwrap(), vec![goal]);
        assert!(service.notifications_of(user.id).await.unwrap().is_empty());
        assert!(service.achievements_of(user.id).await.unwrap().is_empty());
        assert_eq!(service.count_unread(user.id).await.unwrap(), 0);
        assert!(!service.mark_read(NotificationId::new(99)).await.unwrap());
    }
}
