//! In-memory record store and outbox.
//!
//! All tables live behind one mutex, so a commit (entity write, sequence
//! allocation and outbox append) is atomic the way a database transaction is.
//! Conditional writes check and write under the same lock, which is what
//! makes concurrent duplicate deliveries safe in tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use wattwise_core::event::{ChangeTag, DomainEvent, EntityType, EventKind};
use wattwise_core::model::{
    Achievement, AchievementId, ConsumptionRecord, ConsumptionRecordId, Device, DeviceId, Goal,
    GoalId, GoalState, GoalWindow, Kwh, Notification, NotificationId, ReadState, TariffFlag,
    TariffFlagId, User, UserId,
};
use wattwise_core::store::{
    Change, CommitOutcome, OutboxEntry, OutboxStatus, OutboxStore, RecordStore, StoreError,
};
use wattwise_core::{BoxFuture, DateTime, NaiveDate, Utc};

#[derive(Debug, Default)]
struct Tables {
    ids: HashMap<EntityType, i64>,
    sequences: HashMap<(EntityType, i64), u64>,
    users: BTreeMap<UserId, User>,
    devices: BTreeMap<DeviceId, Device>,
    records: BTreeMap<ConsumptionRecordId, ConsumptionRecord>,
    goals: BTreeMap<GoalId, Goal>,
    notifications: BTreeMap<NotificationId, Notification>,
    notification_sources: HashMap<String, NotificationId>,
    achievements: BTreeMap<AchievementId, Achievement>,
    tariff_flags: BTreeMap<NaiveDate, TariffFlag>,
    outbox: BTreeMap<i64, OutboxEntry>,
    next_outbox_id: i64,
    failures_to_inject: u32,
}

struct Staged {
    entity_type: EntityType,
    entity_id: i64,
    kind: EventKind,
    change: Option<ChangeTag>,
    payload: serde_json::Value,
}

fn stage<T: Serialize>(
    entity_type: EntityType,
    entity_id: i64,
    kind: EventKind,
    change: Option<ChangeTag>,
    snapshot: &T,
) -> Result<Staged, StoreError> {
    let payload =
        serde_json::to_value(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Staged {
        entity_type,
        entity_id,
        kind,
        change,
        payload,
    })
}

const fn not_found(entity: EntityType, id: i64) -> StoreError {
    StoreError::NotFound { entity, id }
}

impl Tables {
    fn allocate_id(&mut self, entity: EntityType) -> i64 {
        let id = self.ids.entry(entity).or_insert(0);
        *id += 1;
        *id
    }

    fn settle_goal(
        &mut self,
        goal_id: GoalId,
        tag: ChangeTag,
        transition: impl FnOnce(&mut GoalState) -> bool,
    ) -> Result<Vec<Staged>, StoreError> {
        let goal = self
            .goals
            .get_mut(&goal_id)
            .ok_or_else(|| not_found(EntityType::Goal, goal_id.get()))?;
        if !transition(&mut goal.state) {
            return Ok(Vec::new());
        }
        Ok(vec![stage(
            EntityType::Goal,
            goal_id.get(),
            EventKind::Updated,
            Some(tag),
            &*goal,
        )?])
    }

    fn apply(&mut self, change: Change) -> Result<Vec<Staged>, StoreError> {
        let staged = match change {
            Change::RegisterUser { name, email, at } => {
                let id = UserId::new(self.allocate_id(EntityType::User));
                let user = User {
                    id,
                    name,
                    email,
                    savings_score: 0,
                    created_at: at,
                };
                let staged = stage(EntityType::User, id.get(), EventKind::Created, None, &user)?;
                self.users.insert(id, user);
                vec![staged]
            }
            Change::DeleteUser { user_id, .. } => {
                let user = self
                    .users
                    .remove(&user_id)
                    .ok_or_else(|| not_found(EntityType::User, user_id.get()))?;
                let owned: Vec<DeviceId> = self
                    .devices
                    .values()
                    .filter(|d| d.user_id == user_id)
                    .map(|d| d.id)
                    .collect();
                for device in owned {
                    self.remove_device(device);
                }
                self.goals.retain(|_, g| g.user_id != user_id);
                self.notifications.retain(|_, n| n.user_id != user_id);
                self.notification_sources
                    .retain(|_, id| self.notifications.contains_key(id));
                self.achievements.retain(|_, a| a.user_id != user_id);
                vec![stage(EntityType::User, user_id.get(), EventKind::Deleted, None, &user)?]
            }
            Change::RegisterDevice {
                user_id,
                name,
                rated_power_watts,
                category,
                ..
            } => {
                if !self.users.contains_key(&user_id) {
                    return Err(not_found(EntityType::User, user_id.get()));
                }
                let id = DeviceId::new(self.allocate_id(EntityType::Device));
                let device = Device {
                    id,
                    user_id,
                    name,
                    rated_power_watts,
                    category,
                };
                let staged = stage(EntityType::Device, id.get(), EventKind::Created, None, &device)?;
                self.devices.insert(id, device);
                vec![staged]
            }
            Change::DeleteDevice { device_id, .. } => {
                let device = self
                    .remove_device(device_id)
                    .ok_or_else(|| not_found(EntityType::Device, device_id.get()))?;
                vec![stage(EntityType::Device, device_id.get(), EventKind::Deleted, None, &device)?]
            }
            Change::LogConsumption {
                device_id,
                recorded_at,
                kwh,
                ..
            } => {
                if !self.devices.contains_key(&device_id) {
                    return Err(not_found(EntityType::Device, device_id.get()));
                }
                let id = ConsumptionRecordId::new(self.allocate_id(EntityType::ConsumptionRecord));
                let record = ConsumptionRecord {
                    id,
                    device_id,
                    recorded_at,
                    kwh,
                };
                let staged = stage(
                    EntityType::ConsumptionRecord,
                    id.get(),
                    EventKind::Created,
                    None,
                    &record,
                )?;
                self.records.insert(id, record);
                vec![staged]
            }
            Change::CreateGoal {
                user_id,
                target_kwh,
                window,
                at,
            } => {
                if !self.users.contains_key(&user_id) {
                    return Err(not_found(EntityType::User, user_id.get()));
                }
                let id = GoalId::new(self.allocate_id(EntityType::Goal));
                let goal = Goal {
                    id,
                    user_id,
                    target_kwh,
                    window,
                    state: GoalState::Pending,
                    created_at: at,
                };
                let staged = stage(EntityType::Goal, id.get(), EventKind::Created, None, &goal)?;
                self.goals.insert(id, goal);
                vec![staged]
            }
            Change::AchieveGoal { goal_id, at } => {
                self.settle_goal(goal_id, ChangeTag::GoalAchieved, |state| state.achieve(at))?
            }
            Change::MissGoal { goal_id, at } => {
                self.settle_goal(goal_id, ChangeTag::GoalMissed, |state| state.miss(at))?
            }
            Change::CreateNotification {
                user_id,
                message,
                source,
                at,
            } => {
                if !self.users.contains_key(&user_id) {
                    return Err(not_found(EntityType::User, user_id.get()));
                }
                let dedup_key = source.dedup_key();
                if self.notification_sources.contains_key(&dedup_key) {
                    return Ok(Vec::new());
                }
                let id = NotificationId::new(self.allocate_id(EntityType::Notification));
                let notification = Notification {
                    id,
                    user_id,
                    message,
                    created_at: at,
                    state: ReadState::Unread,
                    source,
                };
                let staged = stage(
                    EntityType::Notification,
                    id.get(),
                    EventKind::Created,
                    None,
                    &notification,
                )?;
                self.notifications.insert(id, notification);
                self.notification_sources.insert(dedup_key, id);
                vec![staged]
            }
            Change::MarkNotificationRead {
                notification_id,
                at,
            } => {
                let notification = self
                    .notifications
                    .get_mut(&notification_id)
                    .ok_or_else(|| not_found(EntityType::Notification, notification_id.get()))?;
                if !notification.state.mark_read(at) {
                    return Ok(Vec::new());
                }
                vec![stage(
                    EntityType::Notification,
                    notification_id.get(),
                    EventKind::Updated,
                    Some(ChangeTag::NotificationRead),
                    &*notification,
                )?]
            }
            Change::UnlockAchievement {
                user_id,
                rule,
                title,
                description,
                points,
                at,
            } => {
                if !self.users.contains_key(&user_id) {
                    return Err(not_found(EntityType::User, user_id.get()));
                }
                if self
                    .achievements
                    .values()
                    .any(|a| a.user_id == user_id && a.rule == rule)
                {
                    return Ok(Vec::new());
                }
                let id = AchievementId::new(self.allocate_id(EntityType::Achievement));
                let achievement = Achievement {
                    id,
                    user_id,
                    rule,
                    title,
                    description,
                    points,
                    unlocked_at: at,
                };
                let created = stage(
                    EntityType::Achievement,
                    id.get(),
                    EventKind::Created,
                    None,
                    &achievement,
                )?;
                self.achievements.insert(id, achievement);
                let user = self
                    .users
                    .get_mut(&user_id)
                    .ok_or_else(|| not_found(EntityType::User, user_id.get()))?;
                user.savings_score += u64::from(points);
                let raised = stage(
                    EntityType::User,
                    user_id.get(),
                    EventKind::Updated,
                    Some(ChangeTag::ScoreRaised),
                    &*user,
                )?;
                vec![created, raised]
            }
            Change::SetTariffFlag {
                tier,
                effective_on,
                at,
            } => {
                if let Some(flag) = self.tariff_flags.get_mut(&effective_on) {
                    if flag.tier == tier {
                        return Ok(Vec::new());
                    }
                    flag.tier = tier;
                    flag.updated_at = at;
                    vec![stage(
                        EntityType::TariffFlag,
                        flag.id.get(),
                        EventKind::Updated,
                        Some(ChangeTag::TierChanged),
                        &*flag,
                    )?]
                } else {
                    let id = TariffFlagId::new(self.allocate_id(EntityType::TariffFlag));
                    let flag = TariffFlag {
                        id,
                        tier,
                        effective_on,
                        updated_at: at,
                    };
                    let staged =
                        stage(EntityType::TariffFlag, id.get(), EventKind::Created, None, &flag)?;
                    self.tariff_flags.insert(effective_on, flag);
                    vec![staged]
                }
            }
        };
        Ok(staged)
    }

    fn remove_device(&mut self, device_id: DeviceId) -> Option<Device> {
        let device = self.devices.remove(&device_id)?;
        self.records.retain(|_, r| r.device_id != device_id);
        Some(device)
    }

    fn append(&mut self, staged: Staged, at: DateTime<Utc>) -> OutboxEntry {
        let sequence = self
            .sequences
            .entry((staged.entity_type, staged.entity_id))
            .or_insert(0);
        *sequence += 1;
        self.next_outbox_id += 1;
        let entry = OutboxEntry {
            id: self.next_outbox_id,
            event: DomainEvent {
                entity_type: staged.entity_type,
                entity_id: staged.entity_id,
                kind: staged.kind,
                sequence: *sequence,
                payload: staged.payload,
                change: staged.change,
                occurred_at: Some(at),
            },
            attempts: 0,
            status: OutboxStatus::Pending,
            created_at: at,
        };
        self.outbox.insert(entry.id, entry.clone());
        entry
    }

    fn user_devices(&self, user: UserId) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| d.user_id == user)
            .map(|d| d.id)
            .collect()
    }
}

/// In-memory [`RecordStore`] and [`OutboxStore`].
///
/// Clones share the same tables.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient database error.
    pub fn fail_next_commits(&self, count: u32) {
        self.tables.lock().unwrap().failures_to_inject = count;
    }

    /// Every outbox row, in commit order.
    #[must_use]
    pub fn outbox(&self) -> Vec<OutboxEntry> {
        self.tables.lock().unwrap().outbox.values().cloned().collect()
    }

    /// Every committed event of `entity_type`, in commit order.
    #[must_use]
    pub fn events_of(&self, entity_type: EntityType) -> Vec<DomainEvent> {
        self.tables
            .lock()
            .unwrap()
            .outbox
            .values()
            .filter(|entry| entry.event.entity_type == entity_type)
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Every notification.
    #[must_use]
    pub fn all_notifications(&self) -> Vec<Notification> {
        self.tables.lock().unwrap().notifications.values().cloned().collect()
    }

    /// Every achievement.
    #[must_use]
    pub fn all_achievements(&self) -> Vec<Achievement> {
        self.tables.lock().unwrap().achievements.values().cloned().collect()
    }

    /// Number of stored consumption records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.tables.lock().unwrap().records.len()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.lock().unwrap())
    }
}

impl RecordStore for InMemoryRecordStore {
    fn commit(&self, change: Change) -> BoxFuture<'_, Result<CommitOutcome, StoreError>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap();
            if tables.failures_to_inject > 0 {
                tables.failures_to_inject -= 1;
                return Err(StoreError::Database("injected failure".to_string()));
            }
            let at = change.at();
            let staged = tables.apply(change)?;
            if staged.is_empty() {
                return Ok(CommitOutcome::Unchanged);
            }
            let entries = staged
                .into_iter()
                .map(|staged| tables.append(staged, at))
                .collect();
            Ok(CommitOutcome::Applied(entries))
        })
    }

    fn user(&self, id: UserId) -> BoxFuture<'_, Result<Option<User>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.users.get(&id).cloned())) })
    }

    fn device(&self, id: DeviceId) -> BoxFuture<'_, Result<Option<Device>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.devices.get(&id).cloned())) })
    }

    fn devices_of(&self, user: UserId) -> BoxFuture<'_, Result<Vec<Device>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.devices
                    .values()
                    .filter(|d| d.user_id == user)
                    .cloned()
                    .collect()
            }))
        })
    }

    fn consumption_record(
        &self,
        id: ConsumptionRecordId,
    ) -> BoxFuture<'_, Result<Option<ConsumptionRecord>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.records.get(&id).cloned())) })
    }

    fn consumption_between(
        &self,
        devices: Vec<DeviceId>,
        window: GoalWindow,
    ) -> BoxFuture<'_, Result<Kwh, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.records
                    .values()
                    .filter(|r| devices.contains(&r.device_id) && window.contains(r.recorded_at))
                    .map(|r| r.kwh)
                    .sum()
            }))
        })
    }

    fn count_consumption_records(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                let devices = t.user_devices(user);
                t.records
                    .values()
                    .filter(|r| devices.contains(&r.device_id))
                    .count() as u64
            }))
        })
    }

    fn goal(&self, id: GoalId) -> BoxFuture<'_, Result<Option<Goal>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.goals.get(&id).cloned())) })
    }

    fn goals_of(&self, user: UserId) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| t.goals.values().filter(|g| g.user_id == user).cloned().collect()))
        })
    }

    fn pending_goals_containing(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.goals
                    .values()
                    .filter(|g| {
                        g.user_id == user && !g.state.is_settled() && g.window.contains(at)
                    })
                    .cloned()
                    .collect()
            }))
        })
    }

    fn pending_goals_closed_by(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.goals
                    .values()
                    .filter(|g| !g.state.is_settled() && g.window.has_closed(now))
                    .cloned()
                    .collect()
            }))
        })
    }

    fn count_achieved_goals(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.goals
                    .values()
                    .filter(|g| g.user_id == user && g.state.is_achieved())
                    .count() as u64
            }))
        })
    }

    fn notification(
        &self,
        id: NotificationId,
    ) -> BoxFuture<'_, Result<Option<Notification>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.notifications.get(&id).cloned())) })
    }

    fn notifications_of(
        &self,
        user: UserId,
    ) -> BoxFuture<'_, Result<Vec<Notification>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.notifications
                    .values()
                    .rev()
                    .filter(|n| n.user_id == user)
                    .cloned()
                    .collect()
            }))
        })
    }

    fn count_unread(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.notifications
                    .values()
                    .filter(|n| n.user_id == user && n.state.is_unread())
                    .count() as u64
            }))
        })
    }

    fn achievements_of(
        &self,
        user: UserId,
    ) -> BoxFuture<'_, Result<Vec<Achievement>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.achievements
                    .values()
                    .filter(|a| a.user_id == user)
                    .cloned()
                    .collect()
            }))
        })
    }

    fn tariff_flag(&self, on: NaiveDate) -> BoxFuture<'_, Result<Option<TariffFlag>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.tariff_flags.get(&on).cloned())) })
    }

    fn active_users(&self) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>> {
        Box::pin(async move { Ok(self.read(|t| t.users.keys().copied().collect())) })
    }
}

impl OutboxStore for InMemoryRecordStore {
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxEntry>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.outbox
                    .values()
                    .filter(|e| e.status == OutboxStatus::Pending)
                    .take(limit)
                    .cloned()
                    .collect()
            }))
        })
    }

    fn mark_forwarded(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            if let Some(entry) = self.tables.lock().unwrap().outbox.get_mut(&id) {
                entry.status = OutboxStatus::Forwarded;
            }
            Ok(())
        })
    }

    fn record_failure(&self, id: i64, _error: String) -> BoxFuture<'_, Result<u32, StoreError>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap();
            let entry = tables
                .outbox
                .get_mut(&id)
                .ok_or_else(|| StoreError::Database(format!("outbox row {id} does not exist")))?;
            entry.attempts += 1;
            Ok(entry.attempts)
        })
    }

    fn mark_dead_lettered(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            if let Some(entry) = self.tables.lock().unwrap().outbox.get_mut(&id) {
                entry.status = OutboxStatus::DeadLettered;
            }
            Ok(())
        })
    }

    fn count_pending(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|t| {
                t.outbox
                    .values()
                    .filter(|e| e.status == OutboxStatus::Pending)
                    .count() as u64
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_clock;
    use wattwise_core::environment::Clock;
    use wattwise_core::model::{DeviceCategory, NotificationSource, RuleId};

    async fn seed(store: &InMemoryRecordStore) -> (UserId, DeviceId) {
        let at = test_clock().now();
        let user = store
            .commit(Change::RegisterUser {
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                at,
            })
            .await
            .unwrap();
        let user_id = UserId::new(user.primary_event().unwrap().entity_id);
        let device = store
            .commit(Change::RegisterDevice {
                user_id,
                name: "Heat pump".to_string(),
                rated_power_watts: 2_000,
                category: DeviceCategory::Climate,
                at,
            })
            .await
            .unwrap();
        (user_id, DeviceId::new(device.primary_event().unwrap().entity_id))
    }

    #[tokio::test]
    async fn sequences_are_per_entity() {
        let store = InMemoryRecordStore::new();
        let (user_id, _) = seed(&store).await;
        let at = test_clock().now();

        for rule in ["a", "b"] {
            store
                .commit(Change::UnlockAchievement {
                    user_id,
                    rule: RuleId::new(rule),
                    title: rule.to_string(),
                    description: String::new(),
                    points: 10,
                    at,
                })
                .await
                .unwrap();
        }

        let user_events = store.events_of(EntityType::User);
        let sequences: Vec<u64> = user_events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(store.user(user_id).await.unwrap().unwrap().savings_score, 20);
        assert!(store.events_of(EntityType::Achievement).iter().all(|e| e.sequence == 1));
    }

    #[tokio::test]
    async fn conditional_writes_report_unchanged() {
        let store = InMemoryRecordStore::new();
        let (user_id, _) = seed(&store).await;
        let at = test_clock().now();
        let unlock = Change::UnlockAchievement {
            user_id,
            rule: RuleId::new("goals-achieved-3"),
            title: "Hat Trick".to_string(),
            description: String::new(),
            points: 50,
            at,
        };

        assert!(store.commit(unlock.clone()).await.unwrap().is_applied());
        assert_eq!(store.commit(unlock).await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(store.user(user_id).await.unwrap().unwrap().savings_score, 50);

        let source = NotificationSource {
            entity_type: EntityType::Goal,
            entity_id: 1,
            sequence: 2,
            recipient: user_id,
        };
        let notify = Change::CreateNotification {
            user_id,
            message: "hi".to_string(),
            source,
            at,
        };
        assert!(store.commit(notify.clone()).await.unwrap().is_applied());
        assert!(!store.commit(notify).await.unwrap().is_applied());
        assert_eq!(store.count_unread(user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missed_goal_leaves_the_pending_set() {
        let store = InMemoryRecordStore::new();
        let (user_id, _) = seed(&store).await;
        let start = test_clock().now();
        let end = start + chrono::Duration::days(7);
        let created = store
            .commit(Change::CreateGoal {
                user_id,
                target_kwh: Kwh::new(1.0).unwrap(),
                window: GoalWindow::new(start, end).unwrap(),
                at: start,
            })
            .await
            .unwrap();
        let goal_id = GoalId::new(created.primary_event().unwrap().entity_id);

        assert!(store.pending_goals_closed_by(end).await.unwrap().is_empty());
        let after = end + chrono::Duration::seconds(1);
        assert_eq!(store.pending_goals_closed_by(after).await.unwrap().len(), 1);

        let missed = store.commit(Change::MissGoal { goal_id, at: after }).await.unwrap();
        assert!(missed.primary_event().unwrap().is_update(ChangeTag::GoalMissed));
        assert!(store.pending_goals_closed_by(after).await.unwrap().is_empty());
        assert!(store.pending_goals_containing(user_id, start).await.unwrap().is_empty());

        let late = store.commit(Change::AchieveGoal { goal_id, at: after }).await.unwrap();
        assert_eq!(late, CommitOutcome::Unchanged);
        let goal = store.goal(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.state, GoalState::Missed { at: after });
        assert_eq!(store.count_achieved_goals(user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleting_a_user_cascades() {
        let store = InMemoryRecordStore::new();
        let (user_id, device_id) = seed(&store).await;
        let at = test_clock().now();
        store
            .commit(Change::LogConsumption {
                device_id,
                recorded_at: at,
                kwh: Kwh::new(3.0).unwrap(),
                at,
            })
            .await
            .unwrap();

        let outcome = store.commit(Change::DeleteUser { user_id, at }).await.unwrap();
        let event = outcome.primary_event().unwrap();
        assert_eq!(event.kind, EventKind::Deleted);
        assert_eq!(outcome.entries().len(), 1);

        assert!(store.device(device_id).await.unwrap().is_none());
        assert_eq!(store.record_count(), 0);
        assert!(matches!(
            store.commit(Change::DeleteUser { user_id, at }).await,
            Err(StoreError::NotFound { entity: EntityType::User, .. })
        ));
    }

    #[tokio::test]
    async fn outbox_tracks_forwarding_state() {
        let store = InMemoryRecordStore::new();
        seed(&store).await;
        assert_eq!(store.count_pending().await.unwrap(), 2);

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending[0].event.entity_type, EntityType::User);
        store.mark_forwarded(pending[0].id).await.unwrap();
        assert_eq!(store.record_failure(pending[1].id, "down".into()).await.unwrap(), 1);
        assert_eq!(store.record_failure(pending[1].id, "down".into()).await.unwrap(), 2);
        store.mark_dead_lettered(pending[1].id).await.unwrap();
        assert_eq!(store.count_pending().await.unwrap(), 0);
    }
}
