//! Domain entities of the energy tracker.
//!
//! Entities are plain snapshots: they are what the record store persists and
//! what event payloads carry. The two one-way state machines, [`GoalState`]
//! and [`ReadState`], only expose forward transitions.

use crate::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;
use thiserror::Error;

use crate::event::{EntityType, EventKey};

/// Rejected input, reported synchronously before anything is written.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// kWh quantity below zero
    #[error("Consumption must not be negative, got {0} kWh")]
    NegativeEnergy(f64),

    /// kWh quantity is NaN or infinite
    #[error("Consumption must be a finite number")]
    NonFiniteEnergy,

    /// Goal target must be strictly positive
    #[error("Goal target must be greater than zero, got {0} kWh")]
    NonPositiveTarget(f64),

    /// Goal window does not satisfy `end > start`
    #[error("Goal window end {end} must be after start {start}")]
    EmptyWindow {
        /// Window start
        start: DateTime<Utc>,
        /// Window end
        end: DateTime<Utc>,
    },

    /// Required text field is blank
    #[error("Field '{0}' must not be blank")]
    Blank(&'static str),

    /// Unrecognized enum name
    #[error("Unknown {kind}: {value}")]
    Unknown {
        /// What was being parsed
        kind: &'static str,
        /// Offending input
        value: String,
    },
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database id.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Raw database id.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// User identifier
    UserId
);
entity_id!(
    /// Device identifier
    DeviceId
);
entity_id!(
    /// Consumption record identifier
    ConsumptionRecordId
);
entity_id!(
    /// Goal identifier
    GoalId
);
entity_id!(
    /// Notification identifier
    NotificationId
);
entity_id!(
    /// Achievement identifier
    AchievementId
);
entity_id!(
    /// Tariff flag identifier
    TariffFlagId
);

/// Non-negative, finite energy quantity in kWh.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Kwh(f64);

impl Kwh {
    /// Zero kWh.
    pub const ZERO: Self = Self(0.0);

    /// Validate a raw quantity.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NonFiniteEnergy`] for NaN or infinity and
    /// [`ValidationError::NegativeEnergy`] below zero.
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteEnergy);
        }
        if value < 0.0 {
            return Err(ValidationError::NegativeEnergy(value));
        }
        Ok(Self(value))
    }

    /// Raw value.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Kwh {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Kwh> for f64 {
    fn from(kwh: Kwh) -> Self {
        kwh.0
    }
}

impl Add for Kwh {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sum for Kwh {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Kwh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} kWh", self.0)
    }
}

/// Account holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Id
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Contact address
    pub email: String,
    /// Gamification score, only ever raised by unlocked achievements
    pub savings_score: u64,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Device grouping used in reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    /// Fridge, washer, oven
    Appliance,
    /// Lamps
    Lighting,
    /// Heating and cooling
    Climate,
    /// Computers, TVs
    Electronics,
    /// Anything else
    Other,
}

impl DeviceCategory {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Appliance => "appliance",
            Self::Lighting => "lighting",
            Self::Climate => "climate",
            Self::Electronics => "electronics",
            Self::Other => "other",
        }
    }
}

impl FromStr for DeviceCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appliance" => Ok(Self::Appliance),
            "lighting" => Ok(Self::Lighting),
            "climate" => Ok(Self::Climate),
            "electronics" => Ok(Self::Electronics),
            "other" => Ok(Self::Other),
            other => Err(ValidationError::Unknown {
                kind: "device category",
                value: other.to_string(),
            }),
        }
    }
}

/// Metered device owned by one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Id
    pub id: DeviceId,
    /// Owner
    pub user_id: UserId,
    /// Display name
    pub name: String,
    /// Nameplate power draw
    pub rated_power_watts: u32,
    /// Category
    pub category: DeviceCategory,
}

/// One immutable reading of a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionRecord {
    /// Id
    pub id: ConsumptionRecordId,
    /// Device the reading belongs to
    pub device_id: DeviceId,
    /// Reading timestamp
    pub recorded_at: DateTime<Utc>,
    /// Energy used
    pub kwh: Kwh,
}

/// Closed time range `[start, end]` with `end > start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow", into = "RawWindow")]
pub struct GoalWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct RawWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawWindow> for GoalWindow {
    type Error = ValidationError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl From<GoalWindow> for RawWindow {
    fn from(window: GoalWindow) -> Self {
        Self {
            start: window.start,
            end: window.end,
        }
    }
}

impl GoalWindow {
    /// Validate a window.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyWindow`] unless `end > start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::EmptyWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Inclusive start.
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Inclusive end.
    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `at` falls inside the window, both ends included.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    /// Whether the window is over at `now`. A reading stamped exactly at
    /// `end` still counts, so the window only closes after it.
    #[must_use]
    pub fn has_closed(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }
}

/// Goal outcome. `Pending` moves to exactly one of `Achieved` or `Missed`,
/// and neither moves again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GoalState {
    /// Not decided yet
    #[default]
    Pending,
    /// Achieved at the given time
    Achieved {
        /// Transition time
        at: DateTime<Utc>,
    },
    /// Window closed without the goal being met
    Missed {
        /// Transition time
        at: DateTime<Utc>,
    },
}

impl GoalState {
    /// Move to `Achieved`. Returns `false` (and keeps the original state)
    /// unless the goal is still pending.
    pub fn achieve(&mut self, at: DateTime<Utc>) -> bool {
        self.settle(Self::Achieved { at })
    }

    /// Move to `Missed`. Returns `false` unless the goal is still pending.
    pub fn miss(&mut self, at: DateTime<Utc>) -> bool {
        self.settle(Self::Missed { at })
    }

    fn settle(&mut self, outcome: Self) -> bool {
        if self.is_settled() {
            return false;
        }
        *self = outcome;
        true
    }

    /// Whether the goal is achieved.
    #[must_use]
    pub const fn is_achieved(&self) -> bool {
        matches!(self, Self::Achieved { .. })
    }

    /// Whether the goal has an outcome.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Savings target over a window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    /// Id
    pub id: GoalId,
    /// Owner
    pub user_id: UserId,
    /// Target consumption
    pub target_kwh: Kwh,
    /// Evaluation window
    pub window: GoalWindow,
    /// Achievement state
    pub state: GoalState,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Notification read state. `Unread → Read`, never back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReadState {
    /// Not read yet
    #[default]
    Unread,
    /// Read at the given time
    Read {
        /// Transition time
        at: DateTime<Utc>,
    },
}

impl ReadState {
    /// Move to `Read`. Returns `false` when already read.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        match self {
            Self::Unread => {
                *self = Self::Read { at };
                true
            }
            Self::Read { .. } => false,
        }
    }

    /// Whether the notification is unread.
    #[must_use]
    pub const fn is_unread(&self) -> bool {
        matches!(self, Self::Unread)
    }
}

/// Event and recipient a notification was produced for.
///
/// At most one notification exists per source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSource {
    /// Entity type of the triggering event
    pub entity_type: EntityType,
    /// Entity id of the triggering event
    pub entity_id: i64,
    /// Sequence of the triggering event
    pub sequence: u64,
    /// Addressee
    pub recipient: UserId,
}

impl NotificationSource {
    /// Source for `event` addressed to `recipient`.
    #[must_use]
    pub const fn new(event: EventKey, recipient: UserId) -> Self {
        Self {
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            sequence: event.sequence,
            recipient,
        }
    }

    /// Stable text key used for the uniqueness constraint.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}#{}@{}",
            self.entity_type, self.entity_id, self.sequence, self.recipient
        )
    }
}

/// Message addressed to one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Id
    pub id: NotificationId,
    /// Addressee
    pub user_id: UserId,
    /// Human-readable text
    pub message: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Read state
    pub state: ReadState,
    /// Event that produced it
    pub source: NotificationSource,
}

/// Achievement rule identifier, e.g. `goals-achieved-3`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Wrap a rule name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Rule name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unlocked gamification rule. One per `(user, rule)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    /// Id
    pub id: AchievementId,
    /// Owner
    pub user_id: UserId,
    /// Rule that was satisfied
    pub rule: RuleId,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Points added to the owner's savings score
    pub points: u32,
    /// Unlock time
    pub unlocked_at: DateTime<Utc>,
}

/// Tariff tier for a day, from cheapest to most expensive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TariffTier {
    /// No surcharge
    #[serde(rename = "GREEN")]
    Green,
    /// Moderate surcharge
    #[serde(rename = "YELLOW")]
    Yellow,
    /// High surcharge, level 1
    #[serde(rename = "RED_1")]
    Red1,
    /// High surcharge, level 2
    #[serde(rename = "RED_2")]
    Red2,
}

impl TariffTier {
    /// Storage and wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red1 => "RED_1",
            Self::Red2 => "RED_2",
        }
    }

    /// Short explanation shown to users.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Green => "favourable generation conditions, no surcharge",
            Self::Yellow => "less favourable conditions, moderate surcharge",
            Self::Red1 => "costly generation, high surcharge",
            Self::Red2 => "very costly generation, highest surcharge",
        }
    }
}

impl fmt::Display for TariffTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TariffTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GREEN" => Ok(Self::Green),
            "YELLOW" => Ok(Self::Yellow),
            "RED_1" => Ok(Self::Red1),
            "RED_2" => Ok(Self::Red2),
            other => Err(ValidationError::Unknown {
                kind: "tariff tier",
                value: other.to_string(),
            }),
        }
    }
}

/// Global tariff tier for one date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TariffFlag {
    /// Id
    pub id: TariffFlagId,
    /// Tier in effect
    pub tier: TariffTier,
    /// Date the tier applies to
    pub effective_on: NaiveDate,
    /// Last change
    pub updated_at: DateTime<Utc>,
}
