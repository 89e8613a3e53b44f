//! Cloneable handle to the store actor.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use shopcast_core::{Cursor, IdentityId, Notification};

use super::commands::{
    NewNotification, NotificationPage, PruneReport, StoreCommand, StoreError, StoreStats,
};

/// Handle for talking to the store actor.
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn new(sender: mpsc::Sender<StoreCommand>) -> Self {
        Self { sender }
    }

    /// Persists a notification for one identity and returns it with its
    /// cursor.
    ///
    /// # Errors
    ///
    /// - `StoreError::Backend` if the write failed; no cursor was used
    /// - `StoreError::ChannelClosed` if the actor has shut down
    pub async fn append(&self, record: NewNotification) -> Result<Notification, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreCommand::Append {
                record,
                respond_to: tx,
            })
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    /// Up to `limit` notifications with cursor greater than `cursor`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// - `StoreError::CursorTooOld` if `cursor` is outside retained history
    /// - `StoreError::ChannelClosed` if the actor has shut down
    pub async fn list_since(
        &self,
        identity: &IdentityId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<NotificationPage, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreCommand::ListSince {
                identity: identity.clone(),
                cursor,
                limit,
                respond_to: tx,
            })
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    /// Marks the identity's notifications up to `upto` as read and returns
    /// how many changed.
    ///
    /// # Errors
    ///
    /// - `StoreError::CursorNotOwned` if `upto` was never issued to `identity`
    pub async fn mark_read(&self, identity: &IdentityId, upto: Cursor) -> Result<usize, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreCommand::MarkRead {
                identity: identity.clone(),
                upto,
                respond_to: tx,
            })
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    /// Applies retention as of `now` and waits for the result.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreCommand::Prune {
                now,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        rx.await.map_err(|_| StoreError::ChannelClosed)
    }

    /// Requests a prune without waiting for it.
    pub async fn trigger_prune(&self) {
        // Fire-and-forget: the actor may be shutting down
        let _ = self
            .sender
            .send(StoreCommand::Prune {
                now: Utc::now(),
                respond_to: None,
            })
            .await;
    }

    /// Returns zeroed stats if the actor is gone.
    pub async fn stats(&self) -> StoreStats {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(StoreCommand::Stats { respond_to: tx })
            .await
            .is_err()
        {
            return StoreStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
