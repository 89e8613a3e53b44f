//! Topics and topic-level access rules.
//!
//! A topic is a `kind:id` key such as `booking:42`, `chat:7`, `user:u-9`
//! or `role:admin`. Keys outside the well-known kinds are allowed as long
//! as they follow the character grammar. A `user:` topic carries any valid
//! [`IdentityId`] after the prefix, so every personal topic parses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult, Identity, IdentityId, Role};

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LEN: usize = 128;

/// A validated topic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

/// Structured view over a topic string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind<'a> {
    Booking(&'a str),
    Chat(&'a str),
    User(&'a str),
    Role(&'a str),
    Other(&'a str),
}

impl Topic {
    /// Parses and validates a topic string.
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let invalid = |reason: &str| DomainError::InvalidTopic {
            topic: raw.clone(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        if raw.len() > MAX_TOPIC_LEN {
            return Err(invalid("too long"));
        }
        if let Some(id) = raw.strip_prefix("user:") {
            if IdentityId::new(id).is_err() {
                return Err(invalid("invalid identity id"));
            }
            return Ok(Self(raw));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
        {
            return Err(invalid("contains characters outside [A-Za-z0-9_-:.]"));
        }
        if raw.starts_with(':') || raw.ends_with(':') {
            return Err(invalid("empty segment"));
        }
        if let Some(("role", role)) = raw.split_once(':') {
            if role.parse::<Role>().map(|r| r.as_str()) != Ok(role) {
                return Err(invalid("unknown role"));
            }
        }

        Ok(Self(raw))
    }

    /// Topic for a booking's status stream.
    pub fn booking(booking_id: impl fmt::Display) -> Self {
        Self(format!("booking:{booking_id}"))
    }

    /// Topic for a chat conversation.
    pub fn chat(conversation_id: impl fmt::Display) -> Self {
        Self(format!("chat:{conversation_id}"))
    }

    /// Personal topic of an identity.
    pub fn user(identity: &IdentityId) -> Self {
        Self(format!("user:{identity}"))
    }

    /// Topic shared by everyone holding a role.
    pub fn role(role: Role) -> Self {
        Self(format!("role:{role}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TopicKind<'_> {
        match self.0.split_once(':') {
            Some(("booking", id)) => TopicKind::Booking(id),
            Some(("chat", id)) => TopicKind::Chat(id),
            Some(("user", id)) => TopicKind::User(id),
            Some(("role", role)) => TopicKind::Role(role),
            _ => TopicKind::Other(&self.0),
        }
    }

    /// Whether `identity` may subscribe to this topic.
    ///
    /// Admins may subscribe to anything. `user:` topics belong to their
    /// identity and `role:` topics to holders of that role; everything else
    /// is open here and checked by the owning collaborator.
    pub fn permits(&self, identity: &Identity) -> bool {
        if identity.is_admin() {
            return true;
        }
        match self.kind() {
            TopicKind::User(id) => id == identity.id.as_str(),
            TopicKind::Role(role) => role == identity.role.as_str(),
            TopicKind::Booking(_) | TopicKind::Chat(_) | TopicKind::Other(_) => true,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
