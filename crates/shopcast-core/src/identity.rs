//! Authenticated identities.
//!
//! An identity is resolved at handshake time by an external auth
//! collaborator. It is never persisted by shopcast.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult, MAX_TOPIC_LEN};

/// Maximum identity id length in bytes, so that `user:<id>` fits a topic.
pub const MAX_IDENTITY_LEN: usize = MAX_TOPIC_LEN - "user:".len();

/// Opaque user id as issued by the platform's account system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Creates an identity id.
    ///
    /// Ids are otherwise opaque but must fit in [`MAX_IDENTITY_LEN`] bytes
    /// without whitespace or control characters. Any id accepted here also
    /// forms a valid `user:` topic.
    pub fn new(id: impl Into<String>) -> DomainResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::EmptyIdentity);
        }
        let invalid = |reason: &str| DomainError::InvalidIdentity {
            id: id.clone(),
            reason: reason.to_string(),
        };
        if id.len() > MAX_IDENTITY_LEN {
            return Err(invalid("too long"));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("contains whitespace or control characters"));
        }
        Ok(Self(id))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform role of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Technician,
    Admin,
}

impl Role {
    /// Lowercase name used in topics and tokens.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Technician => "technician",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(Self::Customer),
            "technician" | "tech" => Ok(Self::Technician),
            "admin" => Ok(Self::Admin),
            other => Err(DomainError::UnknownRole(other.to_string())),
        }
    }
}

/// A user id plus role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub role: Role,
}

impl Identity {
    pub fn new(id: IdentityId, role: Role) -> Self {
        Self { id, role }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_rejects_empty() {
        assert_eq!(IdentityId::new(""), Err(DomainError::EmptyIdentity));
        assert_eq!(IdentityId::new("   "), Err(DomainError::EmptyIdentity));
        assert_eq!(IdentityId::new("u-1").unwrap().as_str(), "u-1");
    }

    #[test]
    fn test_identity_id_accepts_platform_ids() {
        for raw in ["alice@shop.com", "auth0|5f1c", "tech/42", "ünïcode"] {
            assert_eq!(IdentityId::new(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn test_identity_id_rejects_whitespace_and_overlong() {
        assert!(matches!(
            IdentityId::new("alice smith"),
            Err(DomainError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            IdentityId::new("alice\n"),
            Err(DomainError::InvalidIdentity { .. })
        ));
        assert!(IdentityId::new("a".repeat(MAX_IDENTITY_LEN)).is_ok());
        assert!(matches!(
            IdentityId::new("a".repeat(MAX_IDENTITY_LEN + 1)),
            Err(DomainError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("tech".parse::<Role>().unwrap(), Role::Technician);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde_lowercase() {
        let json = serde_json::to_string(&Role::Technician).unwrap();
        assert_eq!(json, "\"technician\"");
    }
}
