//! Domain events and their wire decoding.
//!
//! Producers are not consistent about field names, so decoding accepts both
//! the domain names and the names used by the review service:
//!
//! | domain | wire alias |
//! |---|---|
//! | `entityId` | `productId` |
//! | `value` | `rating` |
//! | `previousValue` | `oldRating` |
//!
//! Unknown fields (e.g. `reviewId`) are ignored.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::EventNamesConfig;
use crate::error::{Result, RollupError};

// ═══════════════════════════════════════════════════════════════════════════════
// Entity Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of the entity an aggregate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(id) => Ok(Self(id)),
            Raw::Text(s) => s
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid entity id {:?}", s))),
        }
    }
}

/// Accepts `5`, `4.5` and `"4.5"`.
fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid number {:?}", s))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Kinds
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Maps broker keys / job names to event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNames {
    pub added: String,
    pub updated: String,
    pub removed: String,
}

impl EventNames {
    pub fn kind_of(&self, name: &str) -> Option<EventKind> {
        if name == self.added {
            Some(EventKind::Added)
        } else if name == self.updated {
            Some(EventKind::Updated)
        } else if name == self.removed {
            Some(EventKind::Removed)
        } else {
            None
        }
    }

    pub fn name_of(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Added => &self.added,
            EventKind::Updated => &self.updated,
            EventKind::Removed => &self.removed,
        }
    }
}

impl Default for EventNames {
    fn default() -> Self {
        Self::from(&EventNamesConfig::default())
    }
}

impl From<&EventNamesConfig> for EventNames {
    fn from(config: &EventNamesConfig) -> Self {
        Self {
            added: config.added.clone(),
            updated: config.updated.clone(),
            removed: config.removed.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Event
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    #[serde(alias = "productId")]
    entity_id: EntityId,
    #[serde(default, alias = "rating", deserialize_with = "lenient_number")]
    value: Option<f64>,
    #[serde(default, alias = "oldRating", deserialize_with = "lenient_number")]
    previous_value: Option<f64>,
}

/// One state change reported by the originating service.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub entity_id: EntityId,
    pub value: Option<f64>,
    /// Only meaningful for [`EventKind::Updated`]
    pub previous_value: Option<f64>,
}

impl DomainEvent {
    pub fn added(entity_id: impl Into<EntityId>, value: f64) -> Self {
        Self {
            kind: EventKind::Added,
            entity_id: entity_id.into(),
            value: Some(value),
            previous_value: None,
        }
    }

    pub fn updated(entity_id: impl Into<EntityId>, previous_value: f64, value: f64) -> Self {
        Self {
            kind: EventKind::Updated,
            entity_id: entity_id.into(),
            value: Some(value),
            previous_value: Some(previous_value),
        }
    }

    pub fn removed(entity_id: impl Into<EntityId>, value: f64) -> Self {
        Self {
            kind: EventKind::Removed,
            entity_id: entity_id.into(),
            value: Some(value),
            previous_value: None,
        }
    }

    /// Decode a job payload. Fails with `InvalidPayload` on anything unusable.
    pub fn from_payload(kind: EventKind, payload: &serde_json::Value) -> Result<Self> {
        let wire = WirePayload::deserialize(payload)
            .map_err(|e| RollupError::invalid_payload(format!("{} payload: {}", kind, e)))?;

        Ok(Self {
            kind,
            entity_id: wire.entity_id,
            value: wire.value,
            previous_value: wire.previous_value,
        })
    }

    /// Encode with the review service's field names.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({ "productId": self.entity_id.0 });
        if let Some(value) = self.value {
            payload["rating"] = serde_json::json!(value);
        }
        if let Some(previous) = self.previous_value {
            payload["oldRating"] = serde_json::json!(previous);
        }
        payload
    }

    /// Validate the fields this kind needs and return the change to apply.
    pub fn change(&self) -> Result<Change> {
        let value = finite(self.value, "value", self.kind)?;
        Ok(match self.kind {
            EventKind::Added => Change::Added { value },
            EventKind::Removed => Change::Removed { value },
            EventKind::Updated => Change::Updated {
                previous: finite(self.previous_value, "previousValue", self.kind)?,
                value,
            },
        })
    }
}

fn finite(v: Option<f64>, field: &str, kind: EventKind) -> Result<f64> {
    match v {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => Err(RollupError::invalid_payload(format!(
            "{} event has non-finite {}: {}",
            kind, field, v
        ))),
        None => Err(RollupError::invalid_payload(format!(
            "{} event is missing {}",
            kind, field
        ))),
    }
}

/// A validated change to one aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change {
    Added { value: f64 },
    Updated { previous: f64, value: f64 },
    Removed { value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_decode_wire_aliases() {
        let payload = json!({"productId": 12, "reviewId": 99, "rating": 4});
        let event = DomainEvent::from_payload(EventKind::Added, &payload).unwrap();
        assert_eq!(event.entity_id, EntityId(12));
        assert_eq!(event.value, Some(4.0));
        assert_eq!(event.change().unwrap(), Change::Added { value: 4.0 });
    }

    #[test]
    fn test_decode_domain_names() {
        let payload = json!({"entityId": "7", "value": 5, "previousValue": "3.5"});
        let event = DomainEvent::from_payload(EventKind::Updated, &payload).unwrap();
        assert_eq!(event.entity_id, EntityId(7));
        assert_eq!(
            event.change().unwrap(),
            Change::Updated { previous: 3.5, value: 5.0 }
        );
    }

    #[test]
    fn test_missing_entity_is_invalid_payload() {
        let err = DomainEvent::from_payload(EventKind::Added, &json!({"rating": 4})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_non_numeric_entity_is_invalid_payload() {
        let err = DomainEvent::from_payload(EventKind::Added, &json!({"productId": "abc", "rating": 4}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_missing_value_rejected_by_change() {
        let event = DomainEvent::from_payload(EventKind::Removed, &json!({"productId": 1})).unwrap();
        assert_eq!(event.change().unwrap_err().code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_updated_requires_previous_value() {
        let event = DomainEvent::from_payload(EventKind::Updated, &json!({"productId": 1, "rating": 2}))
            .unwrap();
        assert_eq!(event.change().unwrap_err().code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_payload_roundtrip_uses_wire_names() {
        let event = DomainEvent::updated(3, 2.0, 4.0);
        let payload = event.to_payload();
        assert_eq!(payload, json!({"productId": 3, "rating": 4.0, "oldRating": 2.0}));
        assert_eq!(DomainEvent::from_payload(EventKind::Updated, &payload).unwrap(), event);
    }

    #[test]
    fn test_event_names_lookup() {
        let names = EventNames::default();
        assert_eq!(names.kind_of("review-added"), Some(EventKind::Added));
        assert_eq!(names.kind_of("review-updated"), Some(EventKind::Updated));
        assert_eq!(names.kind_of("review-deleted"), Some(EventKind::Removed));
        assert_eq!(names.kind_of("review-flagged"), None);
        assert_eq!(names.name_of(EventKind::Removed), "review-deleted");
    }
}
