//! Notification store using the actor pattern.
//!
//! Durable notifications are kept per identity with a monotonically
//! increasing cursor. The actor owns all state; every read and write goes
//! through a [`StoreHandle`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  StoreCommand  ┌─────────────────┐     ┌─────────────────┐
//! │ Router/Gateway  │───────────────▶│   StoreActor    │────▶│  StoreBackend   │
//! │ (StoreHandle)   │◀───────────────│ (cursor owner)  │     │ (memory, jsonl) │
//! └─────────────────┘    oneshot     └─────────────────┘     └─────────────────┘
//!                                            ▲
//!                                            │ Prune (interval)
//!                                    ┌───────┴───────┐
//!                                    │  prune task   │
//!                                    └───────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

mod actor;
mod backend;
mod commands;
mod handle;
mod jsonl;

pub use actor::StoreActor;
pub use backend::{JournalEntry, MemoryBackend, StoreBackend};
pub use commands::{
    NewNotification, NotificationPage, PruneReport, StoreCommand, StoreError, StoreStats,
};
pub use handle::StoreHandle;
pub use jsonl::JsonlBackend;

use crate::config::{StoreBackendKind, StoreConfig};

const COMMAND_BUFFER: usize = 256;

/// Retention rules applied by the prune task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_per_identity: usize,
    pub max_age: Duration,
    pub prune_interval: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for Retention {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_per_identity: config.max_per_identity,
            max_age: config.max_age(),
            prune_interval: config.prune_interval(),
        }
    }
}

impl Retention {
    /// Notifications created before the returned instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let age = chrono::Duration::from_std(self.max_age).ok()?;
        now.checked_sub_signed(age)
    }
}

/// Opens the backend named by `config`.
pub async fn open_backend(config: &StoreConfig) -> Result<Arc<dyn StoreBackend>, StoreError> {
    match config.backend {
        StoreBackendKind::Memory => Ok(Arc::new(MemoryBackend)),
        StoreBackendKind::Jsonl => {
            let dir = config
                .data_dir
                .clone()
                .ok_or_else(|| StoreError::Backend("jsonl backend needs a data_dir".to_string()))?;
            Ok(Arc::new(JsonlBackend::open(dir).await?))
        }
    }
}

/// Replays the backend journal, spawns the store actor and its prune task,
/// and returns a handle.
///
/// # Errors
///
/// Fails only if the journal cannot be read.
pub async fn spawn_store(
    backend: Arc<dyn StoreBackend>,
    retention: Retention,
) -> Result<StoreHandle, StoreError> {
    let journal = backend.load().await?;
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let mut actor = StoreActor::new(cmd_rx, backend, retention);
    let restored = actor.restore(journal);
    if restored > 0 {
        info!(notifications = restored, "Restored notification history");
    }
    tokio::spawn(actor.run());

    spawn_prune_task(cmd_tx.downgrade(), retention.prune_interval);
    Ok(StoreHandle::new(cmd_tx))
}

/// Periodically applies retention until every handle is dropped.
fn spawn_prune_task(sender: mpsc::WeakSender<StoreCommand>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(sender) = sender.upgrade() else {
                debug!("Prune task stopping: store handles dropped");
                break;
            };
            StoreHandle::new(sender).trigger_prune().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shopcast_core::{Cursor, EventId, IdentityId, Topic};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn record(identity: &IdentityId, n: u64) -> NewNotification {
        NewNotification {
            identity: identity.clone(),
            topic: Topic::booking(n),
            event_id: EventId::new(format!("evt-{n}")),
            payload: json!({"n": n}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_gapless() {
        let store = spawn_store(Arc::new(MemoryBackend), Retention::default())
            .await
            .unwrap();
        let alice = IdentityId::new("alice").unwrap();

        let mut tasks = Vec::new();
        for n in 0..50 {
            let store = store.clone();
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move {
                store.append(record(&alice, n)).await.unwrap().cursor
            }));
        }

        let mut cursors = HashSet::new();
        for task in tasks {
            assert!(cursors.insert(task.await.unwrap()));
        }
        let expected: HashSet<Cursor> = (1..=50).map(Cursor::new).collect();
        assert_eq!(cursors, expected);
    }

    #[tokio::test]
    async fn test_jsonl_history_survives_restart() {
        let dir = TempDir::new().unwrap();
        let alice = IdentityId::new("alice").unwrap();

        {
            let backend = Arc::new(JsonlBackend::open(dir.path()).await.unwrap());
            let store = spawn_store(backend, Retention::default()).await.unwrap();
            for n in 1..=3 {
                store.append(record(&alice, n)).await.unwrap();
            }
            store.mark_read(&alice, Cursor::new(1)).await.unwrap();
        }

        let backend = Arc::new(JsonlBackend::open(dir.path()).await.unwrap());
        let store = spawn_store(backend, Retention::default()).await.unwrap();

        let page = store.list_since(&alice, Cursor::ZERO, 10).await.unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.items[0].read);
        assert!(!page.items[1].read);

        let next = store.append(record(&alice, 4)).await.unwrap();
        assert_eq!(next.cursor, Cursor::new(4));
    }

    #[tokio::test]
    async fn test_pruned_jsonl_history_survives_restart() {
        let dir = TempDir::new().unwrap();
        let alice = IdentityId::new("alice").unwrap();
        let retention = Retention {
            max_per_identity: 2,
            ..Retention::default()
        };

        {
            let backend = Arc::new(JsonlBackend::open(dir.path()).await.unwrap());
            let store = spawn_store(backend, retention).await.unwrap();
            for n in 1..=5 {
                store.append(record(&alice, n)).await.unwrap();
            }
            let report = store.prune(Utc::now()).await.unwrap();
            assert_eq!(report.removed, 3);
        }

        let backend = Arc::new(JsonlBackend::open(dir.path()).await.unwrap());
        let store = spawn_store(backend, retention).await.unwrap();

        let err = store.list_since(&alice, Cursor::new(1), 10).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::CursorTooOld {
                requested: Cursor::new(1),
                resume_from: Cursor::new(3)
            }
        );
        let page = store.list_since(&alice, Cursor::new(3), 10).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(store.append(record(&alice, 6)).await.unwrap().cursor, Cursor::new(6));
    }

    #[test]
    fn test_retention_cutoff() {
        let retention = Retention {
            max_age: Duration::from_secs(3600),
            ..Retention::default()
        };
        let now = Utc::now();
        assert_eq!(retention.cutoff(now), Some(now - chrono::Duration::hours(1)));
        assert_eq!(Retention::default().max_per_identity, 500);
    }
}
