//! Store actor commands, errors and results.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use shopcast_core::{Cursor, EventId, IdentityId, Notification, Topic};

// ============================================================================
// Store Commands
// ============================================================================

/// Commands sent to the store actor.
///
/// Every request carries a oneshot for its reply. `Prune` may be sent
/// without one by the background prune task.
#[derive(Debug)]
pub enum StoreCommand {
    /// Persist a notification and allocate its cursor.
    Append {
        record: NewNotification,
        respond_to: oneshot::Sender<Result<Notification, StoreError>>,
    },

    /// Notifications of `identity` with cursor greater than `cursor`.
    ListSince {
        identity: IdentityId,
        cursor: Cursor,
        limit: usize,
        respond_to: oneshot::Sender<Result<NotificationPage, StoreError>>,
    },

    /// Mark everything up to and including `upto` as read.
    MarkRead {
        identity: IdentityId,
        upto: Cursor,
        respond_to: oneshot::Sender<Result<usize, StoreError>>,
    },

    /// Apply retention as of `now`.
    Prune {
        now: DateTime<Utc>,
        respond_to: Option<oneshot::Sender<PruneReport>>,
    },

    Stats {
        respond_to: oneshot::Sender<StoreStats>,
    },
}

/// A notification before it has a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub identity: IdentityId,
    pub topic: Topic,
    pub event_id: EventId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Results
// ============================================================================

/// One page of a catch-up, oldest first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub has_more: bool,
}

impl NotificationPage {
    /// Cursor of the newest item on the page.
    pub fn last_cursor(&self) -> Option<Cursor> {
        self.items.last().map(|n| n.cursor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneReport {
    pub identities: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub identities: usize,
    pub notifications: usize,
    pub unread: usize,
}

// ============================================================================
// Store Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The cursor points into pruned history. Catch-up must restart from
    /// `resume_from`.
    #[error("Cursor {requested} is older than retained history (resume from {resume_from})")]
    CursorTooOld { requested: Cursor, resume_from: Cursor },

    /// The cursor was never issued to this identity.
    #[error("Cursor {cursor} does not belong to {identity}")]
    CursorNotOwned { identity: IdentityId, cursor: Cursor },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Store actor channel closed")]
    ChannelClosed,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(err.to_string())
    }
}
