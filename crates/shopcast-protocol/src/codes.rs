//! Error codes carried in `error` frames and WebSocket close codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable code of an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedFrame,
    UnknownType,
    NotAuthenticated,
    InvalidTopic,
    ForbiddenTopic,
    SubscriptionLimit,
    /// The requested cursor was pruned; the client must resync.
    CursorTooOld,
    CursorNotOwned,
    StoreUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedFrame => "malformed_frame",
            Self::UnknownType => "unknown_type",
            Self::NotAuthenticated => "not_authenticated",
            Self::InvalidTopic => "invalid_topic",
            Self::ForbiddenTopic => "forbidden_topic",
            Self::SubscriptionLimit => "subscription_limit",
            Self::CursorTooOld => "cursor_too_old",
            Self::CursorNotOwned => "cursor_not_owned",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    /// Whether this error counts towards the malformed-frame budget.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::MalformedFrame | Self::UnknownType)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the server closed a connection. Maps onto a WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Client asked to close, or the transport ended.
    Normal,
    /// Server shutting down.
    Shutdown,
    AuthFailed,
    VersionMismatch,
    HandshakeTimeout,
    /// Outbound buffer stayed above the high-water mark past the grace period.
    SlowConsumer,
    HeartbeatTimeout,
    TooManyMalformedFrames,
}

impl CloseReason {
    pub const fn code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Shutdown => 1001,
            Self::AuthFailed => 4001,
            Self::VersionMismatch => 4002,
            Self::HandshakeTimeout => 4003,
            Self::SlowConsumer => 4008,
            Self::HeartbeatTimeout => 4009,
            Self::TooManyMalformedFrames => 4010,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Normal,
            1001 => Self::Shutdown,
            4001 => Self::AuthFailed,
            4002 => Self::VersionMismatch,
            4003 => Self::HandshakeTimeout,
            4008 => Self::SlowConsumer,
            4009 => Self::HeartbeatTimeout,
            4010 => Self::TooManyMalformedFrames,
            _ => return None,
        })
    }

    /// Short reason text sent in the close frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Shutdown => "server-shutdown",
            Self::AuthFailed => "auth-failed",
            Self::VersionMismatch => "version-mismatch",
            Self::HandshakeTimeout => "handshake-timeout",
            Self::SlowConsumer => "slow-consumer",
            Self::HeartbeatTimeout => "heartbeat-timeout",
            Self::TooManyMalformedFrames => "too-many-malformed-frames",
        }
    }

    /// Whether a well-behaved client should reconnect after this close.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthFailed | Self::VersionMismatch)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
