//! Domain event envelope and topic model.
//!
//! Every owned-entity change is described by one [`DomainEvent`]. The envelope
//! is serialized as JSON on the wire:
//!
//! ```json
//! {
//!   "entityType": "goal",
//!   "entityId": 7,
//!   "kind": "updated",
//!   "sequence": 2,
//!   "payload": { "...": "post-change snapshot" },
//!   "change": "goal-achieved",
//!   "occurredAt": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! `sequence` is strictly increasing per `(entityType, entityId)` and is the
//! only ordering consumers rely on. `change` and `occurredAt` are optional so
//! that envelopes produced by older writers still decode.

use crate::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while encoding or decoding event envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Envelope could not be encoded
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Bytes on the wire are not a valid envelope
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Envelope is valid but its payload does not match the entity snapshot
    #[error("Payload of {entity_type} event does not match its snapshot: {reason}")]
    PayloadMismatch {
        /// Entity type named by the envelope
        entity_type: EntityType,
        /// Decoder message
        reason: String,
    },

    /// Entity type or topic name is not part of the model
    #[error("Unknown entity type or topic: {0}")]
    UnknownName(String),
}

/// Owned entity kinds that produce events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    /// Account holder
    User,
    /// Metered appliance owned by a user
    Device,
    /// Single kWh reading of a device
    ConsumptionRecord,
    /// Savings target over a time window
    Goal,
    /// Message addressed to a user
    Notification,
    /// Unlocked gamification rule
    Achievement,
    /// Global tariff tier for a date
    TariffFlag,
}

impl EntityType {
    /// Every entity type, in topic declaration order.
    pub const ALL: [Self; 7] = [
        Self::ConsumptionRecord,
        Self::Goal,
        Self::Notification,
        Self::Achievement,
        Self::TariffFlag,
        Self::User,
        Self::Device,
    ];

    /// Wire name used in the envelope's `entityType` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Device => "device",
            Self::ConsumptionRecord => "consumption-record",
            Self::Goal => "goal",
            Self::Notification => "notification",
            Self::Achievement => "achievement",
            Self::TariffFlag => "tariff-flag",
        }
    }

    /// Topic carrying this entity's events.
    #[must_use]
    pub const fn topic(self) -> Topic {
        match self {
            Self::User => Topic::User,
            Self::Device => Topic::Device,
            Self::ConsumptionRecord => Topic::Consumption,
            Self::Goal => Topic::Goal,
            Self::Notification => Topic::Notification,
            Self::Achievement => Topic::Achievement,
            Self::TariffFlag => Topic::TariffFlag,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|entity| entity.as_str() == s)
            .ok_or_else(|| EventError::UnknownName(s.to_string()))
    }
}

/// Transport topics, one per entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `consumption`
    Consumption,
    /// `goal`
    Goal,
    /// `notification`
    Notification,
    /// `achievement`
    Achievement,
    /// `tariff-flag`
    TariffFlag,
    /// `user`
    User,
    /// `device`
    Device,
}

impl Topic {
    /// Topic name on the broker.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consumption => "consumption",
            Self::Goal => "goal",
            Self::Notification => "notification",
            Self::Achievement => "achievement",
            Self::TariffFlag => "tariff-flag",
            Self::User => "user",
            Self::Device => "device",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .map(EntityType::topic)
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| EventError::UnknownName(s.to_string()))
    }
}

/// Lifecycle step the event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Entity was inserted
    Created,
    /// Entity changed
    Updated,
    /// Entity (and everything it owns) was removed
    Deleted,
}

impl EventKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            other => Err(EventError::UnknownName(other.to_string())),
        }
    }
}

/// Which field group an `updated` event touched.
///
/// Consumers filter on this instead of diffing snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeTag {
    /// Goal moved from pending to achieved
    GoalAchieved,
    /// Goal window closed without the goal being met
    GoalMissed,
    /// User savings score increased
    ScoreRaised,
    /// Notification moved from unread to read
    NotificationRead,
    /// Tariff tier for an existing date changed
    TierChanged,
}

impl ChangeTag {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GoalAchieved => "goal-achieved",
            Self::GoalMissed => "goal-missed",
            Self::ScoreRaised => "score-raised",
            Self::NotificationRead => "notification-read",
            Self::TierChanged => "tier-changed",
        }
    }
}

impl fmt::Display for ChangeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeTag {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::GoalAchieved,
            Self::GoalMissed,
            Self::ScoreRaised,
            Self::NotificationRead,
            Self::TierChanged,
        ]
        .into_iter()
        .find(|tag| tag.as_str() == s)
        .ok_or_else(|| EventError::UnknownName(s.to_string()))
    }
}

/// Identity of one event: `(entityType, entityId, sequence)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    /// Entity type
    pub entity_type: EntityType,
    /// Entity id
    pub entity_id: i64,
    /// Per-entity sequence number
    pub sequence: u64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.entity_type, self.entity_id, self.sequence)
    }
}

/// Envelope describing one entity change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Entity type that changed
    pub entity_type: EntityType,
    /// Entity id that changed
    pub entity_id: i64,
    /// Created, updated or deleted
    pub kind: EventKind,
    /// Per-entity sequence, allocated in the writing transaction
    pub sequence: u64,
    /// Post-change snapshot (last snapshot for deletions)
    pub payload: serde_json::Value,
    /// Which field group an update touched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeTag>,
    /// Commit time of the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl DomainEvent {
    /// Build an envelope from an entity snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the snapshot cannot be
    /// represented as JSON.
    pub fn from_snapshot<T: Serialize>(
        entity_type: EntityType,
        entity_id: i64,
        kind: EventKind,
        sequence: u64,
        snapshot: &T,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        let payload = serde_json::to_value(snapshot)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;
        Ok(Self {
            entity_type,
            entity_id,
            kind,
            sequence,
            payload,
            change: None,
            occurred_at: Some(occurred_at),
        })
    }

    /// Attach a change tag.
    #[must_use]
    pub const fn with_change(mut self, change: ChangeTag) -> Self {
        self.change = Some(change);
        self
    }

    /// Identity used for deduplication.
    #[must_use]
    pub const fn key(&self) -> EventKey {
        EventKey {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            sequence: self.sequence,
        }
    }

    /// Topic this event is published to.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.entity_type.topic()
    }

    /// Transport message key: the entity id in decimal.
    #[must_use]
    pub fn message_key(&self) -> String {
        self.entity_id.to_string()
    }

    /// Whether this is an `updated` event carrying `tag`.
    #[must_use]
    pub fn is_update(&self, tag: ChangeTag) -> bool {
        self.kind == EventKind::Updated && self.change == Some(tag)
    }

    /// Decode the payload as an entity snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::PayloadMismatch`] when the payload does not have
    /// the shape of `T`.
    pub fn snapshot<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        T::deserialize(&self.payload).map_err(|e| EventError::PayloadMismatch {
            entity_type: self.entity_type,
            reason: e.to_string(),
        })
    }

    /// Encode the envelope as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] for anything that is not
    /// a well-formed envelope.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn envelope_uses_camel_case_wire_names() {
        let event = DomainEvent::from_snapshot(
            EntityType::Goal,
            7,
            EventKind::Updated,
            2,
            &json!({ "id": 7 }),
            at(),
        )
        .unwrap()
        .with_change(ChangeTag::GoalAchieved);

        let value: serde_json::Value =
            serde_json::from_slice(&event.to_json_bytes().unwrap()).unwrap();

        assert_eq!(value["entityType"], "goal");
        assert_eq!(value["entityId"], 7);
        assert_eq!(value["kind"], "updated");
        assert_eq!(value["sequence"], 2);
        assert_eq!(value["change"], "goal-achieved");
        assert_eq!(value["payload"]["id"], 7);
        assert!(value.get("occurredAt").is_some());
    }

    #[test]
    fn decodes_minimal_envelope() {
        let raw = br#"{"entityType":"consumption-record","entityId":3,"kind":"created","sequence":1,"payload":{}}"#;
        let event = DomainEvent::from_json_bytes(raw).unwrap();

        assert_eq!(event.entity_type, EntityType::ConsumptionRecord);
        assert_eq!(event.change, None);
        assert_eq!(event.occurred_at, None);
        assert_eq!(event.message_key(), "3");
        assert_eq!(event.topic(), Topic::Consumption);
    }

    #[test]
    fn rejects_unknown_entity_type() {
        let raw = br#"{"entityType":"meter","entityId":3,"kind":"created","sequence":1,"payload":{}}"#;
        assert!(matches!(
            DomainEvent::from_json_bytes(raw),
            Err(EventError::DeserializationError(_))
        ));
        assert!(DomainEvent::from_json_bytes(b"not json").is_err());
    }

    #[test]
    fn every_entity_has_a_distinct_topic() {
        let mut names: Vec<_> = EntityType::ALL.iter().map(|e| e.topic().as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EntityType::ALL.len());

        for entity in EntityType::ALL {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
            assert_eq!(entity.topic().as_str().parse::<Topic>().unwrap(), entity.topic());
        }
        assert_eq!(EntityType::TariffFlag.topic().as_str(), "tariff-flag");
    }

    #[test]
    fn is_update_requires_matching_tag() {
        let event =
            DomainEvent::from_snapshot(EntityType::Goal, 1, EventKind::Updated, 3, &json!({}), at())
                .unwrap();
        assert!(!event.is_update(ChangeTag::GoalAchieved));
        assert!(event.clone().with_change(ChangeTag::GoalAchieved).is_update(ChangeTag::GoalAchieved));
        assert!(!event.with_change(ChangeTag::GoalMissed).is_update(ChangeTag::GoalAchieved));
        assert_eq!("goal-missed".parse::<ChangeTag>().unwrap(), ChangeTag::GoalMissed);
    }

    #[test]
    fn event_key_display() {
        let key = EventKey {
            entity_type: EntityType::Notification,
            entity_id: 9,
            sequence: 4,
        };
        assert_eq!(key.to_string(), "notification:9#4");
    }
}
