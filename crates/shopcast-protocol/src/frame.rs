//! Frame types exchanged over a connection.
//!
//! Every frame is a JSON object with a `type` tag, sent as one WebSocket
//! text message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopcast_core::{ConnectionId, Cursor, EventId, IdentityId, Notification, Role};

use crate::codes::ErrorCode;
use crate::version::ProtocolVersion;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First-frame authentication, when no token was given in the URL.
    Auth {
        token: String,
        /// Last cursor the client has seen; triggers an immediate catch-up.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<ProtocolVersion>,
    },

    Subscribe {
        topic: String,
    },

    Unsubscribe {
        topic: String,
    },

    /// Mark every notification up to `cursor` as read.
    Ack {
        cursor: Cursor,
    },

    /// Request notifications after `cursor`.
    CatchUp {
        cursor: Cursor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// Application-level answer to a server probe.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl ClientFrame {
    /// Tags accepted in the `type` field.
    pub const TYPES: &'static [&'static str] = &[
        "auth",
        "subscribe",
        "unsubscribe",
        "ack",
        "catch_up",
        "ping",
        "pong",
    ];

    pub fn auth(token: impl Into<String>, cursor: Option<Cursor>) -> Self {
        Self::Auth {
            token: token.into(),
            cursor,
            protocol_version: Some(ProtocolVersion::CURRENT),
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::Subscribe {
            topic: topic.into(),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            topic: topic.into(),
        }
    }

    pub fn ack(cursor: Cursor) -> Self {
        Self::Ack { cursor }
    }

    pub fn catch_up(cursor: Cursor, limit: Option<usize>) -> Self {
        Self::CatchUp { cursor, limit }
    }

    pub fn ping(seq: u64) -> Self {
        Self::Ping { seq: Some(seq) }
    }
}

/// Frames sent by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        connection_id: ConnectionId,
        identity: IdentityId,
        role: Role,
        protocol_version: ProtocolVersion,
    },

    /// Handshake refused; followed by a close frame.
    Rejected {
        reason: String,
        /// WebSocket close code that follows.
        code: u16,
        protocol_version: ProtocolVersion,
    },

    Subscribed {
        topic: String,
    },

    Unsubscribed {
        topic: String,
    },

    /// Live event delivery.
    Event {
        event_id: EventId,
        topic: String,
        payload: serde_json::Value,
        sent_at: DateTime<Utc>,
    },

    /// Catch-up batch, oldest first.
    Notifications {
        items: Vec<Notification>,
        /// More notifications exist after the last item.
        has_more: bool,
    },

    /// Result of an `ack`.
    Read {
        cursor: Cursor,
        updated: usize,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    Error {
        code: ErrorCode,
        message: String,
        /// Smallest cursor `catch_up` still accepts, for `cursor_too_old`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oldest_cursor: Option<Cursor>,
    },
}

impl ServerFrame {
    pub fn connected(
        connection_id: ConnectionId,
        identity: IdentityId,
        role: Role,
        protocol_version: ProtocolVersion,
    ) -> Self {
        Self::Connected {
            connection_id,
            identity,
            role,
            protocol_version,
        }
    }

    pub fn rejected(reason: &str, code: u16) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            code,
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn error(code: ErrorCode, message: &str) -> Self {
        Self::Error {
            code,
            message: message.to_string(),
            oldest_cursor: None,
        }
    }

    /// The resync condition returned instead of an empty catch-up.
    pub fn cursor_too_old(requested: Cursor, resume_from: Cursor) -> Self {
        Self::Error {
            code: ErrorCode::CursorTooOld,
            message: format!(
                "cursor {requested} is older than retained history; resync from {resume_from}"
            ),
            oldest_cursor: Some(resume_from),
        }
    }

    pub fn notifications(items: Vec<Notification>, has_more: bool) -> Self {
        Self::Notifications { items, has_more }
    }

    pub fn pong(seq: Option<u64>) -> Self {
        Self::Pong { seq }
    }

    /// Serializes to the JSON text of a WebSocket message.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
