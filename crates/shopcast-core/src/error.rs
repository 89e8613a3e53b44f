//! Domain-specific error types following panic-free policy.

use crate::ConnectionState;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Topic string does not follow the topic grammar
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Unknown role name
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Identity ids must be non-empty
    #[error("Identity id must not be empty")]
    EmptyIdentity,

    /// Identity id contains whitespace or control characters, or is too long
    #[error("Invalid identity id '{id}': {reason}")]
    InvalidIdentity { id: String, reason: String },

    /// Illegal connection state machine transition
    #[error("Invalid connection transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
