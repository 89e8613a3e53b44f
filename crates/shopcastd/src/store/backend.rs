//! Persistence seam of the notification store.
//!
//! The actor keeps every retained notification in memory and writes each
//! mutation through a [`StoreBackend`]. At startup the backend replays its
//! journal so cursors continue where they left off.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shopcast_core::{Cursor, IdentityId, Notification};

use super::StoreError;

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Notification(Notification),
    Read { identity: IdentityId, upto: Cursor },
    /// Everything up to and including `through` was pruned.
    Pruned { identity: IdentityId, through: Cursor },
}

impl JournalEntry {
    pub fn identity(&self) -> &IdentityId {
        match self {
            Self::Notification(n) => &n.identity,
            Self::Read { identity, .. } | Self::Pruned { identity, .. } => identity,
        }
    }
}

/// Durable storage used by the store actor.
///
/// Calls are made from the actor task only, one at a time.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Every journal entry, in write order per identity.
    async fn load(&self) -> Result<Vec<JournalEntry>, StoreError>;

    /// Persists a new notification. The cursor is only committed when this
    /// returns `Ok`.
    async fn append(&self, notification: &Notification) -> Result<(), StoreError>;

    async fn mark_read(&self, identity: &IdentityId, upto: Cursor) -> Result<(), StoreError>;

    /// Rewrites an identity's history after pruning.
    async fn compact(
        &self,
        identity: &IdentityId,
        pruned_through: Cursor,
        retained: &[Notification],
    ) -> Result<(), StoreError>;

    /// Appends a prune watermark without rewriting history. Used when
    /// [`StoreBackend::compact`] fails, so that replay still drops the
    /// pruned range.
    async fn record_pruned(&self, identity: &IdentityId, through: Cursor) -> Result<(), StoreError>;
}

/// Backend that keeps nothing; history is lost on restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(Vec::new())
    }

    async fn append(&self, _notification: &Notification) -> Result<(), StoreError> {
        Ok(())
    }

    async fn mark_read(&self, _identity: &IdentityId, _upto: Cursor) -> Result<(), StoreError> {
        Ok(())
    }

    async fn compact(
        &self,
        _identity: &IdentityId,
        _pruned_through: Cursor,
        _retained: &[Notification],
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_pruned(&self, _identity: &IdentityId, _through: Cursor) -> Result<(), StoreError> {
        Ok(())
    }
}
