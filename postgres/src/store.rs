//! `PostgreSQL` record store and transactional outbox.
//!
//! Every [`Change`] runs in one transaction that writes the entity rows,
//! bumps the per-entity counter in `entity_sequences` and inserts the
//! resulting events into `outbox`. Conditional changes are single statements
//! (`UPDATE ... WHERE achieved_at IS NULL`, `INSERT ... ON CONFLICT DO
//! NOTHING`), so concurrent duplicates resolve in the database.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use std::fmt::Display;
use wattwise_core::BoxFuture;
use wattwise_core::event::{ChangeTag, DomainEvent, EntityType, EventKind};
use wattwise_core::model::{
    Achievement, AchievementId, ConsumptionRecord, ConsumptionRecordId, Device, DeviceCategory,
    DeviceId, Goal, GoalId, GoalState, GoalWindow, Kwh, Notification, NotificationId,
    NotificationSource, ReadState, RuleId, TariffFlag, TariffFlagId, TariffTier, User, UserId,
};
use wattwise_core::store::{
    Change, CommitOutcome, OutboxEntry, OutboxStatus, OutboxStore, RecordStore, StoreError,
};

#[allow(clippy::needless_pass_by_value)]
fn db(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn corrupt(err: impl Display) -> StoreError {
    StoreError::Serialization(err.to_string())
}

const fn not_found(entity: EntityType, id: i64) -> StoreError {
    StoreError::NotFound { entity, id }
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    name: String,
    email: String,
    savings_score: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: UserId::new(row.id),
            name: row.name,
            email: row.email,
            savings_score: u64::try_from(row.savings_score).map_err(corrupt)?,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct DeviceRow {
    id: i64,
    user_id: i64,
    name: String,
    rated_power_watts: i32,
    category: String,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: DeviceId::new(row.id),
            user_id: UserId::new(row.user_id),
            name: row.name,
            rated_power_watts: u32::try_from(row.rated_power_watts).map_err(corrupt)?,
            category: row.category.parse::<DeviceCategory>().map_err(corrupt)?,
        })
    }
}

#[derive(FromRow)]
struct RecordRow {
    id: i64,
    device_id: i64,
    recorded_at: DateTime<Utc>,
    kwh: f64,
}

impl TryFrom<RecordRow> for ConsumptionRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: ConsumptionRecordId::new(row.id),
            device_id: DeviceId::new(row.device_id),
            recorded_at: row.recorded_at,
            kwh: Kwh::new(row.kwh).map_err(corrupt)?,
        })
    }
}

#[derive(FromRow)]
struct GoalRow {
    id: i64,
    user_id: i64,
    target_kwh: f64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    achieved_at: Option<DateTime<Utc>>,
    missed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl GoalRow {
    fn state(&self) -> GoalState {
        match (self.achieved_at, self.missed_at) {
            (Some(at), _) => GoalState::Achieved { at },
            (None, Some(at)) => GoalState::Missed { at },
            (None, None) => GoalState::Pending,
        }
    }
}

impl TryFrom<GoalRow> for Goal {
    type Error = StoreError;

    fn try_from(row: GoalRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: GoalId::new(row.id),
            user_id: UserId::new(row.user_id),
            target_kwh: Kwh::new(row.target_kwh).map_err(corrupt)?,
            window: GoalWindow::new(row.window_start, row.window_end).map_err(corrupt)?,
            state: row.state(),
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct NotificationRow {
    id: i64,
    user_id: i64,
    message: String,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
    source_entity_type: String,
    source_entity_id: i64,
    source_sequence: i64,
    recipient_id: i64,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: NotificationId::new(row.id),
            user_id: UserId::new(row.user_id),
            message: row.message,
            created_at: row.created_at,
            state: row.read_at.map_or(ReadState::Unread, |at| ReadState::Read { at }),
            source: NotificationSource {
                entity_type: row.source_entity_type.parse().map_err(corrupt)?,
                entity_id: row.source_entity_id,
                sequence: u64::try_from(row.source_sequence).map_err(corrupt)?,
                recipient: UserId::new(row.recipient_id),
            },
        })
    }
}

#[derive(FromRow)]
struct AchievementRow {
    id: i64,
    user_id: i64,
    rule_id: String,
    title: String,
    description: String,
    points: i32,
    unlocked_at: DateTime<Utc>,
}

impl TryFrom<AchievementRow> for Achievement {
    type Error = StoreError;

    fn try_from(row: AchievementRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: AchievementId::new(row.id),
            user_id: UserId::new(row.user_id),
            rule: RuleId::new(row.rule_id),
            title: row.title,
            description: row.description,
            points: u32::try_from(row.points).map_err(corrupt)?,
            unlocked_at: row.unlocked_at,
        })
    }
}

#[derive(FromRow)]
struct TariffRow {
    id: i64,
    tier: String,
    effective_on: NaiveDate,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TariffRow> for TariffFlag {
    type Error = StoreError;

    fn try_from(row: TariffRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: TariffFlagId::new(row.id),
            tier: row.tier.parse::<TariffTier>().map_err(corrupt)?,
            effective_on: row.effective_on,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TariffUpsertRow {
    #[sqlx(flatten)]
    flag: TariffRow,
    inserted: bool,
}

#[derive(FromRow)]
struct OutboxRow {
    id: i64,
    event: serde_json::Value,
    attempts: i32,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, StoreError> {
        let status = match row.status.as_str() {
            "pending" => OutboxStatus::Pending,
            "forwarded" => OutboxStatus::Forwarded,
            "dead_lettered" => OutboxStatus::DeadLettered,
            other => return Err(corrupt(format!("unknown outbox status '{other}'"))),
        };
        Ok(Self {
            id: row.id,
            event: serde_json::from_value(row.event).map_err(corrupt)?,
            attempts: u32::try_from(row.attempts).map_err(corrupt)?,
            status,
            created_at: row.created_at,
        })
    }
}

/// Event waiting for its sequence number.
struct Staged {
    entity_type: EntityType,
    entity_id: i64,
    kind: EventKind,
    change: Option<ChangeTag>,
    payload: serde_json::Value,
}

impl Staged {
    fn new<T: Serialize>(
        entity_type: EntityType,
        entity_id: i64,
        kind: EventKind,
        change: Option<ChangeTag>,
        snapshot: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            entity_type,
            entity_id,
            kind,
            change,
            payload: serde_json::to_value(snapshot).map_err(corrupt)?,
        })
    }
}

async fn exists(conn: &mut PgConnection, sql: &str, id: i64) -> Result<bool, StoreError> {
    let (found,): (bool,) = sqlx::query_as(sql)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(db)?;
    Ok(found)
}

async fn require_user(conn: &mut PgConnection, user_id: UserId) -> Result<(), StoreError> {
    if exists(conn, "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)", user_id.get()).await? {
        Ok(())
    } else {
        Err(not_found(EntityType::User, user_id.get()))
    }
}

/// Write the entity rows for `change`; empty when a conditional write found
/// nothing to do.
#[allow(clippy::too_many_lines)]
/// Conditional `Pending → Achieved | Missed`; an already settled goal
/// stages nothing.
async fn settle_goal(
    conn: &mut PgConnection,
    sql: &str,
    goal_id: GoalId,
    at: DateTime<Utc>,
    tag: ChangeTag,
) -> Result<Vec<Staged>, StoreError> {
    let row = sqlx::query_as::<_, GoalRow>(sql)
        .bind(goal_id.get())
        .bind(at)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    let Some(row) = row else {
        let sql = "SELECT EXISTS (SELECT 1 FROM goals WHERE id = $1)";
        return if exists(conn, sql, goal_id.get()).await? {
            Ok(Vec::new())
        } else {
            Err(not_found(EntityType::Goal, goal_id.get()))
        };
    };
    let goal = Goal::try_from(row)?;
    Ok(vec![Staged::new(
        EntityType::Goal,
        goal.id.get(),
        EventKind::Updated,
        Some(tag),
        &goal,
    )?])
}

async fn apply(conn: &mut PgConnection, change: Change) -> Result<Vec<Staged>, StoreError> {
    let staged = match change {
        Change::RegisterUser { name, email, at } => {
            let user: User = sqlx::query_as::<_, UserRow>(
                r"
                INSERT INTO users (name, email, savings_score, created_at)
                VALUES ($1, $2, 0, $3)
                RETURNING id, name, email, savings_score, created_at
                ",
            )
            .bind(name)
            .bind(email)
            .bind(at)
            .fetch_one(&mut *conn)
            .await
            .map_err(db)?
            .try_into()?;
            vec![Staged::new(EntityType::User, user.id.get(), EventKind::Created, None, &user)?]
        }
        Change::DeleteUser { user_id, .. } => {
            let user: User = sqlx::query_as::<_, UserRow>(
                "DELETE FROM users WHERE id = $1 RETURNING id, name, email, savings_score, created_at",
            )
            .bind(user_id.get())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found(EntityType::User, user_id.get()))?
            .try_into()?;
            vec![Staged::new(EntityType::User, user.id.get(), EventKind::Deleted, None, &user)?]
        }
        Change::RegisterDevice {
            user_id,
            name,
            rated_power_watts,
            category,
            ..
        } => {
            require_user(conn, user_id).await?;
            let device: Device = sqlx::query_as::<_, DeviceRow>(
                r"
                INSERT INTO devices (user_id, name, rated_power_watts, category)
                VALUES ($1, $2, $3, $4)
                RETURNING id, user_id, name, rated_power_watts, category
                ",
            )
            .bind(user_id.get())
            .bind(name)
            .bind(i32::try_from(rated_power_watts).map_err(corrupt)?)
            .bind(category.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(db)?
            .try_into()?;
            vec![Staged::new(EntityType::Device, device.id.get(), EventKind::Created, None, &device)?]
        }
        Change::DeleteDevice { device_id, .. } => {
            let device: Device = sqlx::query_as::<_, DeviceRow>(
                "DELETE FROM devices WHERE id = $1 RETURNING id, user_id, name, rated_power_watts, category",
            )
            .bind(device_id.get())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?
            .ok_or_else(|| not_found(EntityType::Device, device_id.get()))?
            .try_into()?;
            vec![Staged::new(EntityType::Device, device.id.get(), EventKind::Deleted, None, &device)?]
        }
        Change::LogConsumption {
            device_id,
            recorded_at,
            kwh,
            ..
        } => {
            let sql = "SELECT EXISTS (SELECT 1 FROM devices WHERE id = $1)";
            if !exists(conn, sql, device_id.get()).await? {
                return Err(not_found(EntityType::Device, device_id.get()));
            }
            let record: ConsumptionRecord = sqlx::query_as::<_, RecordRow>(
                r"
                INSERT INTO consumption_records (device_id, recorded_at, kwh)
                VALUES ($1, $2, $3)
                RETURNING id, device_id, recorded_at, kwh
                ",
            )
            .bind(device_id.get())
            .bind(recorded_at)
            .bind(kwh.value())
            .fetch_one(&mut *conn)
            .await
            .map_err(db)?
            .try_into()?;
            vec![Staged::new(
                EntityType::ConsumptionRecord,
                record.id.get(),
                EventKind::Created,
                None,
                &record,
            )?]
        }
        Change::CreateGoal {
            user_id,
            target_kwh,
            window,
            at,
        } => {
            require_user(conn, user_id).await?;
            let goal: Goal = sqlx::query_as::<_, GoalRow>(
                r"
                INSERT INTO goals (user_id, target_kwh, window_start, window_end, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                ",
            )
            .bind(user_id.get())
            .bind(target_kwh.value())
            .bind(window.start())
            .bind(window.end())
            .bind(at)
            .fetch_one(&mut *conn)
            .await
            .map_err(db)?
            .try_into()?;
            vec![Staged::new(EntityType::Goal, goal.id.get(), EventKind::Created, None, &goal)?]
        }
        Change::AchieveGoal { goal_id, at } => {
            let sql = r"
                UPDATE goals SET achieved_at = $2
                WHERE id = $1 AND achieved_at IS NULL AND missed_at IS NULL
                RETURNING id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                ";
            settle_goal(conn, sql, goal_id, at, ChangeTag::GoalAchieved).await?
        }
        Change::MissGoal { goal_id, at } => {
            let sql = r"
                UPDATE goals SET missed_at = $2
                WHERE id = $1 AND achieved_at IS NULL AND missed_at IS NULL
                RETURNING id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                ";
            settle_goal(conn, sql, goal_id, at, ChangeTag::GoalMissed).await?
        }
        Change::CreateNotification {
            user_id,
            message,
            source,
            at,
        } => {
            require_user(conn, user_id).await?;
            let row = sqlx::query_as::<_, NotificationRow>(
                r"
                INSERT INTO notifications (
                    user_id, message, created_at,
                    source_entity_type, source_entity_id, source_sequence, recipient_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source_entity_type, source_entity_id, source_sequence, recipient_id)
                DO NOTHING
                RETURNING id, user_id, message, created_at, read_at,
                          source_entity_type, source_entity_id, source_sequence, recipient_id
                ",
            )
            .bind(user_id.get())
            .bind(message)
            .bind(at)
            .bind(source.entity_type.as_str())
            .bind(source.entity_id)
            .bind(i64::try_from(source.sequence).map_err(corrupt)?)
            .bind(source.recipient.get())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
            match row {
                Some(row) => {
                    let notification = Notification::try_from(row)?;
                    vec![Staged::new(
                        EntityType::Notification,
                        notification.id.get(),
                        EventKind::Created,
                        None,
                        &notification,
                    )?]
                }
                None => Vec::new(),
            }
        }
        Change::MarkNotificationRead {
            notification_id,
            at,
        } => {
            let row = sqlx::query_as::<_, NotificationRow>(
                r"
                UPDATE notifications SET read_at = $2
                WHERE id = $1 AND read_at IS NULL
                RETURNING id, user_id, message, created_at, read_at,
                          source_entity_type, source_entity_id, source_sequence, recipient_id
                ",
            )
            .bind(notification_id.get())
            .bind(at)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
            let Some(row) = row else {
                let sql = "SELECT EXISTS (SELECT 1 FROM notifications WHERE id = $1)";
                return if exists(conn, sql, notification_id.get()).await? {
                    Ok(Vec::new())
                } else {
                    Err(not_found(EntityType::Notification, notification_id.get()))
                };
            };
            let notification = Notification::try_from(row)?;
            vec![Staged::new(
                EntityType::Notification,
                notification.id.get(),
                EventKind::Updated,
                Some(ChangeTag::NotificationRead),
                &notification,
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
            // Lock the user row: the score update below must not interleave
            // with another unlock for the same user.
            let locked: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id.get())
                .fetch_optional(&mut *conn)
                .await
                .map_err(db)?;
            if locked.is_none() {
                return Err(not_found(EntityType::User, user_id.get()));
            }
            let row = sqlx::query_as::<_, AchievementRow>(
                r"
                INSERT INTO achievements (user_id, rule_id, title, description, points, unlocked_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (user_id, rule_id) DO NOTHING
                RETURNING id, user_id, rule_id, title, description, points, unlocked_at
                ",
            )
            .bind(user_id.get())
            .bind(rule.as_str())
            .bind(title)
            .bind(description)
            .bind(i32::try_from(points).map_err(corrupt)?)
            .bind(at)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
            let Some(row) = row else {
                return Ok(Vec::new());
            };
            let achievement = Achievement::try_from(row)?;
            let user: User = sqlx::query_as::<_, UserRow>(
                r"
                UPDATE users SET savings_score = savings_score + $2
                WHERE id = $1
                RETURNING id, name, email, savings_score, created_at
                ",
            )
            .bind(user_id.get())
            .bind(i64::from(points))
            .fetch_one(&mut *conn)
            .await
            .map_err(db)?
            .try_into()?;
            vec![
                Staged::new(
                    EntityType::Achievement,
                    achievement.id.get(),
                    EventKind::Created,
                    None,
                    &achievement,
                )?,
                Staged::new(
                    EntityType::User,
                    user.id.get(),
                    EventKind::Updated,
                    Some(ChangeTag::ScoreRaised),
                    &user,
                )?,
            ]
        }
        Change::SetTariffFlag {
            tier,
            effective_on,
            at,
        } => {
            let row = sqlx::query_as::<_, TariffUpsertRow>(
                r"
                INSERT INTO tariff_flags (tier, effective_on, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (effective_on) DO UPDATE
                    SET tier = EXCLUDED.tier, updated_at = EXCLUDED.updated_at
                    WHERE tariff_flags.tier <> EXCLUDED.tier
                RETURNING id, tier, effective_on, updated_at, (xmax = 0) AS inserted
                ",
            )
            .bind(tier.as_str())
            .bind(effective_on)
            .bind(at)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
            match row {
                Some(TariffUpsertRow { flag, inserted }) => {
                    let flag = TariffFlag::try_from(flag)?;
                    let (kind, tag) = if inserted {
                        (EventKind::Created, None)
                    } else {
                        (EventKind::Updated, Some(ChangeTag::TierChanged))
                    };
                    vec![Staged::new(EntityType::TariffFlag, flag.id.get(), kind, tag, &flag)?]
                }
                None => Vec::new(),
            }
        }
    };
    Ok(staged)
}

/// Allocate the next sequence for the staged event's entity and append it to
/// the outbox.
async fn append(
    conn: &mut PgConnection,
    staged: Staged,
    at: DateTime<Utc>,
) -> Result<OutboxEntry, StoreError> {
    let (sequence,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO entity_sequences (entity_type, entity_id, last_sequence)
        VALUES ($1, $2, 1)
        ON CONFLICT (entity_type, entity_id)
        DO UPDATE SET last_sequence = entity_sequences.last_sequence + 1
        RETURNING last_sequence
        ",
    )
    .bind(staged.entity_type.as_str())
    .bind(staged.entity_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db)?;

    let event = DomainEvent {
        entity_type: staged.entity_type,
        entity_id: staged.entity_id,
        kind: staged.kind,
        sequence: u64::try_from(sequence).map_err(corrupt)?,
        payload: staged.payload,
        change: staged.change,
        occurred_at: Some(at),
    };
    let envelope = serde_json::to_value(&event).map_err(corrupt)?;

    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO outbox (entity_type, entity_id, sequence, topic, event, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        ",
    )
    .bind(event.entity_type.as_str())
    .bind(event.entity_id)
    .bind(sequence)
    .bind(event.topic().as_str())
    .bind(&envelope)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .map_err(db)?;

    Ok(OutboxEntry {
        id,
        event,
        attempts: 0,
        status: OutboxStatus::Pending,
        created_at: at,
    })
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn count(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(corrupt)
}

/// [`RecordStore`] and [`OutboxStore`] over a connection pool.
#[derive(Clone, Debug)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Store over `pool`. Run [`crate::MIGRATOR`] first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl RecordStore for PostgresRecordStore {
    fn commit(&self, change: Change) -> BoxFuture<'_, Result<CommitOutcome, StoreError>> {
        Box::pin(async move {
            let at = change.at();
            let entity_type = change.entity_type();
            let mut tx = self.pool.begin().await.map_err(db)?;

            let staged = apply(&mut tx, change).await?;
            if staged.is_empty() {
                tx.rollback().await.map_err(db)?;
                tracing::debug!(entity_type = %entity_type, "Conditional write found nothing to do");
                return Ok(CommitOutcome::Unchanged);
            }

            let mut entries = Vec::with_capacity(staged.len());
            for event in staged {
                entries.push(append(&mut tx, event, at).await?);
            }
            tx.commit().await.map_err(db)?;

            tracing::debug!(
                entity_type = %entity_type,
                events = entries.len(),
                "Change committed with outbox rows"
            );
            Ok(CommitOutcome::Applied(entries))
        })
    }

    fn user(&self, id: UserId) -> BoxFuture<'_, Result<Option<User>, StoreError>> {
        Box::pin(async move {
            sqlx::query_as::<_, UserRow>(
                "SELECT id, name, email, savings_score, created_at FROM users WHERE id = $1",
            )
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(User::try_from)
            .transpose()
        })
    }

    fn device(&self, id: DeviceId) -> BoxFuture<'_, Result<Option<Device>, StoreError>> {
        Box::pin(async move {
            sqlx::query_as::<_, DeviceRow>(
                "SELECT id, user_id, name, rated_power_watts, category FROM devices WHERE id = $1",
            )
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(Device::try_from)
            .transpose()
        })
    }

    fn devices_of(&self, user: UserId) -> BoxFuture<'_, Result<Vec<Device>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, DeviceRow>(
                r"
                SELECT id, user_id, name, rated_power_watts, category
                FROM devices WHERE user_id = $1 ORDER BY id
                ",
            )
            .bind(user.get())
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn consumption_record(
        &self,
        id: ConsumptionRecordId,
    ) -> BoxFuture<'_, Result<Option<ConsumptionRecord>, StoreError>> {
        Box::pin(async move {
            sqlx::query_as::<_, RecordRow>(
                "SELECT id, device_id, recorded_at, kwh FROM consumption_records WHERE id = $1",
            )
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(ConsumptionRecord::try_from)
            .transpose()
        })
    }

    fn consumption_between(
        &self,
        devices: Vec<DeviceId>,
        window: GoalWindow,
    ) -> BoxFuture<'_, Result<Kwh, StoreError>> {
        Box::pin(async move {
            let ids: Vec<i64> = devices.iter().map(|d| d.get()).collect();
            let (total,): (f64,) = sqlx::query_as(
                r"
                SELECT COALESCE(SUM(kwh), 0)::DOUBLE PRECISION
                FROM consumption_records
                WHERE device_id = ANY($1) AND recorded_at BETWEEN $2 AND $3
                ",
            )
            .bind(&ids)
            .bind(window.start())
            .bind(window.end())
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
            Kwh::new(total).map_err(corrupt)
        })
    }

    fn count_consumption_records(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let (n,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM consumption_records r
                JOIN devices d ON d.id = r.device_id
                WHERE d.user_id = $1
                ",
            )
            .bind(user.get())
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
            count(n)
        })
    }

    fn goal(&self, id: GoalId) -> BoxFuture<'_, Result<Option<Goal>, StoreError>> {
        Box::pin(async move {
            sqlx::query_as::<_, GoalRow>(
                r"
                SELECT id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                FROM goals WHERE id = $1
                ",
            )
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(Goal::try_from)
            .transpose()
        })
    }

    fn goals_of(&self, user: UserId) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, GoalRow>(
                r"
                SELECT id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                FROM goals WHERE user_id = $1 ORDER BY id
                ",
            )
            .bind(user.get())
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn pending_goals_containing(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, GoalRow>(
                r"
                SELECT id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                FROM goals
                WHERE user_id = $1 AND achieved_at IS NULL AND missed_at IS NULL
                  AND window_start <= $2 AND window_end >= $2
                ORDER BY id
                ",
            )
            .bind(user.get())
            .bind(at)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn pending_goals_closed_by(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Goal>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, GoalRow>(
                r"
                SELECT id, user_id, target_kwh, window_start, window_end, achieved_at, missed_at, created_at
                FROM goals
                WHERE achieved_at IS NULL AND missed_at IS NULL AND window_end < $1
                ORDER BY id
                ",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn count_achieved_goals(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM goals WHERE user_id = $1 AND achieved_at IS NOT NULL",
            )
            .bind(user.get())
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
            count(n)
        })
    }

    fn notification(
        &self,
        id: NotificationId,
    ) -> BoxFuture<'_, Result<Option<Notification>, StoreError>> {
        Box::pin(async move {
            sqlx::query_as::<_, NotificationRow>(
                r"
                SELECT id, user_id, message, created_at, read_at,
                       source_entity_type, source_entity_id, source_sequence, recipient_id
                FROM notifications WHERE id = $1
                ",
            )
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(Notification::try_from)
            .transpose()
        })
    }

    fn notifications_of(
        &self,
        user: UserId,
    ) -> BoxFuture<'_, Result<Vec<Notification>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, NotificationRow>(
                r"
                SELECT id, user_id, message, created_at, read_at,
                       source_entity_type, source_entity_id, source_sequence, recipient_id
                FROM notifications WHERE user_id = $1
                ORDER BY created_at DESC, id DESC
                ",
            )
            .bind(user.get())
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn count_unread(&self, user: UserId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND read_at IS NULL",
            )
            .bind(user.get())
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
            count(n)
        })
    }

    fn achievements_of(
        &self,
        user: UserId,
    ) -> BoxFuture<'_, Result<Vec<Achievement>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, AchievementRow>(
                r"
                SELECT id, user_id, rule_id, title, description, points, unlocked_at
                FROM achievements WHERE user_id = $1 ORDER BY id
                ",
            )
            .bind(user.get())
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn tariff_flag(&self, on: NaiveDate) -> BoxFuture<'_, Result<Option<TariffFlag>, StoreError>> {
        Box::pin(async move {
            sqlx::query_as::<_, TariffRow>(
                "SELECT id, tier, effective_on, updated_at FROM tariff_flags WHERE effective_on = $1",
            )
            .bind(on)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(TariffFlag::try_from)
            .transpose()
        })
    }

    fn active_users(&self) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>> {
        Box::pin(async move {
            let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
            Ok(ids.into_iter().map(|(id,)| UserId::new(id)).collect())
        })
    }
}

impl OutboxStore for PostgresRecordStore {
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxEntry>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, OutboxRow>(
                r"
                SELECT id, event, attempts, status, created_at
                FROM outbox WHERE status = 'pending'
                ORDER BY id
                LIMIT $1
                ",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            collect(rows)
        })
    }

    fn mark_forwarded(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("UPDATE outbox SET status = 'forwarded', forwarded_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db)?;
            Ok(())
        })
    }

    fn record_failure(&self, id: i64, error: String) -> BoxFuture<'_, Result<u32, StoreError>> {
        Box::pin(async move {
            let attempts: Option<(i32,)> = sqlx::query_as(
                r"
                UPDATE outbox SET attempts = attempts + 1, last_error = $2
                WHERE id = $1
                RETURNING attempts
                ",
            )
            .bind(id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
            let (attempts,) =
                attempts.ok_or_else(|| StoreError::Database(format!("outbox row {id} does not exist")))?;
            u32::try_from(attempts).map_err(corrupt)
        })
    }

    fn mark_dead_lettered(&self, id: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("UPDATE outbox SET status = 'dead_lettered' WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db)?;
            Ok(())
        })
    }

    fn count_pending(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;
            count(n)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn goal_rows_map_achievement_state() {
        let row = GoalRow {
            id: 1,
            user_id: 2,
            target_kwh: 100.0,
            window_start: at(),
            window_end: at() + chrono::Duration::days(7),
            achieved_at: Some(at()),
            missed_at: None,
            created_at: at(),
        };
        let goal = Goal::try_from(row).unwrap();
        assert!(goal.state.is_achieved());
        assert_eq!(goal.user_id, UserId::new(2));

        let row = GoalRow {
            id: 3,
            user_id: 2,
            target_kwh: 100.0,
            window_start: at(),
            window_end: at() + chrono::Duration::days(7),
            achieved_at: None,
            missed_at: Some(at() + chrono::Duration::days(8)),
            created_at: at(),
        };
        let goal = Goal::try_from(row).unwrap();
        assert_eq!(goal.state, GoalState::Missed { at: at() + chrono::Duration::days(8) });
    }

    #[test]
    fn corrupt_rows_are_serialization_errors() {
        let row = DeviceRow {
            id: 1,
            user_id: 1,
            name: "kettle".to_string(),
            rated_power_watts: -5,
            category: "appliance".to_string(),
        };
        assert!(matches!(Device::try_from(row), Err(StoreError::Serialization(_))));

        let row = OutboxRow {
            id: 1,
            event: serde_json::json!({}),
            attempts: 0,
            status: "lost".to_string(),
            created_at: at(),
        };
        assert!(matches!(OutboxEntry::try_from(row), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn notification_rows_restore_their_source() {
        let row = NotificationRow {
            id: 9,
            user_id: 3,
            message: "Tariff is RED_1".to_string(),
            created_at: at(),
            read_at: None,
            source_entity_type: "tariff-flag".to_string(),
            source_entity_id: 1,
            source_sequence: 2,
            recipient_id: 3,
        };
        let notification = Notification::try_from(row).unwrap();
        assert!(notification.state.is_unread());
        assert_eq!(notification.source.dedup_key(), "tariff-flag:1#2@3");
    }
}
