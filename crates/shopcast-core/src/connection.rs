//! Connection identifiers and the per-connection state machine.
//!
//! ```text
//! Connecting -> Authenticated -> Active <-> Backpressured -> Closing -> Closed
//! ```
//!
//! Any non-terminal state may also go straight to `Closing`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Process-unique connection id.
///
/// Assigned by the gateway from a monotonically increasing counter and used
/// as the key into every connection-indexed collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Backpressured,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Active)
                | (Active, Backpressured)
                | (Backpressured, Active)
                | (Connecting | Authenticated | Active | Backpressured, Closing)
                | (Closing, Closed)
        )
    }

    /// Validated transition.
    pub fn transition(self, next: ConnectionState) -> DomainResult<ConnectionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Live delivery is attempted only in these states.
    #[must_use]
    pub fn accepts_delivery(self) -> bool {
        matches!(self, Self::Active | Self::Backpressured)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Backpressured => "backpressured",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let s = Connecting.transition(Authenticated).unwrap();
        let s = s.transition(Active).unwrap();
        let s = s.transition(Backpressured).unwrap();
        let s = s.transition(Active).unwrap();
        let s = s.transition(Closing).unwrap();
        let s = s.transition(Closed).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(Connecting.transition(Active).is_err());
        assert!(Closed.transition(Active).is_err());
        assert!(Closed.transition(Closing).is_err());
        assert!(Authenticated.transition(Backpressured).is_err());
        assert!(Active.transition(Closed).is_err());
    }

    #[test]
    fn test_accepts_delivery() {
        assert!(Active.accepts_delivery());
        assert!(Backpressured.accepts_delivery());
        assert!(!Authenticated.accepts_delivery());
        assert!(!Closing.accepts_delivery());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }
}
