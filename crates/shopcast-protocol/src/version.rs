//! Protocol versioning and handshake negotiation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol version spoken on a connection.
///
/// Uses semantic versioning: major.minor
/// - Major version bump: breaking envelope changes, incompatible
/// - Minor version bump: additive frame types or fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 1 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }

    /// Major versions must match; any minor is compatible.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Picks the version used for a connection.
    ///
    /// A client that names no version gets `CURRENT`. Otherwise the majors
    /// must agree and the lower minor wins, so an older client is never sent
    /// frames it does not know.
    pub fn negotiate(requested: Option<ProtocolVersion>) -> Result<Self, VersionError> {
        let Some(requested) = requested else {
            return Ok(Self::CURRENT);
        };
        if !requested.is_compatible_with(&Self::CURRENT) {
            return Err(VersionError::Incompatible {
                got: requested.to_string(),
                expected: format!("{}.x", Self::CURRENT.major),
            });
        }
        Ok(Self::new(
            Self::CURRENT.major,
            requested.minor.min(Self::CURRENT.minor),
        ))
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}
