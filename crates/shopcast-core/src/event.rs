//! Domain events entering the delivery layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{IdentityId, Topic};

/// Caller-visible event id, used by clients to match a live frame with its
/// replayed notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (v4) id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an event must survive the recipient being offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Delivered to live connections only.
    #[default]
    Ephemeral,
    /// Also appended to each recipient's notification log.
    Durable,
}

/// A transient routed event. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topics: Vec<Topic>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<IdentityId>,
    pub durability: Durability,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Topic used when an event is recorded for a recipient that matched
    /// through none of its topics.
    pub fn primary_topic(&self) -> Option<&Topic> {
        self.topics.first()
    }

    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.durability == Durability::Durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn test_event_serialization_omits_missing_target() {
        let event = Event {
            id: EventId::new("evt-1"),
            topics: vec![Topic::booking(42)],
            payload: json!({"status": "repairing"}),
            target: None,
            durability: Durability::Durable,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"durability\":\"durable\""));
        assert!(!json.contains("target"));
        assert_eq!(event.primary_topic(), Some(&Topic::booking(42)));
    }
}
