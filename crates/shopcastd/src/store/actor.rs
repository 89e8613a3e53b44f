//! Store actor implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shopcast_core::{Cursor, IdentityId, Notification};

use super::backend::{JournalEntry, StoreBackend};
use super::commands::{
    NewNotification, NotificationPage, PruneReport, StoreCommand, StoreError, StoreStats,
};
use super::Retention;

/// Retained history of one identity.
#[derive(Debug, Default)]
struct IdentityLog {
    /// Last cursor issued. Never decreases, even when everything is pruned.
    last: Cursor,
    /// Everything at or below this cursor has been pruned.
    pruned_through: Cursor,
    /// Retained notifications, ascending by cursor.
    entries: VecDeque<Notification>,
}

impl IdentityLog {
    fn insert_restored(&mut self, notification: Notification) {
        if notification.cursor > self.last {
            self.last = notification.cursor;
        }
        if notification.cursor <= self.pruned_through {
            return;
        }
        let at = self
            .entries
            .partition_point(|n| n.cursor < notification.cursor);
        match self.entries.get(at) {
            Some(existing) if existing.cursor == notification.cursor => {}
            _ => self.entries.insert(at, notification),
        }
    }

    fn apply_read(&mut self, upto: Cursor) -> usize {
        let mut updated = 0;
        for n in self.entries.iter_mut().take_while(|n| n.cursor <= upto) {
            if !n.read {
                n.read = true;
                updated += 1;
            }
        }
        updated
    }

    fn apply_pruned(&mut self, through: Cursor) {
        if through > self.pruned_through {
            self.pruned_through = through;
        }
        if through > self.last {
            self.last = through;
        }
        while self
            .entries
            .front()
            .is_some_and(|n| n.cursor <= self.pruned_through)
        {
            self.entries.pop_front();
        }
    }
}

// ============================================================================
// Store Actor
// ============================================================================

/// Owns every identity's notification log.
///
/// Commands are processed one at a time, which makes cursor allocation per
/// identity atomic: two concurrent appends can never observe the same
/// predecessor.
pub struct StoreActor {
    receiver: mpsc::Receiver<StoreCommand>,
    backend: Arc<dyn StoreBackend>,
    retention: Retention,
    logs: HashMap<IdentityId, IdentityLog>,
}

impl StoreActor {
    pub fn new(
        receiver: mpsc::Receiver<StoreCommand>,
        backend: Arc<dyn StoreBackend>,
        retention: Retention,
    ) -> Self {
        Self {
            receiver,
            backend,
            retention,
            logs: HashMap::new(),
        }
    }

    /// Rebuilds state from a backend journal. Returns the number of
    /// notifications retained.
    pub fn restore(&mut self, entries: Vec<JournalEntry>) -> usize {
        for entry in entries {
            match entry {
                JournalEntry::Notification(n) => {
                    self.logs
                        .entry(n.identity.clone())
                        .or_default()
                        .insert_restored(n);
                }
                JournalEntry::Read { identity, upto } => {
                    self.logs.entry(identity).or_default().apply_read(upto);
                }
                JournalEntry::Pruned { identity, through } => {
                    self.logs.entry(identity).or_default().apply_pruned(through);
                }
            }
        }
        self.logs.values().map(|log| log.entries.len()).sum()
    }

    /// Runs the actor until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            backend = self.backend.name(),
            identities = self.logs.len(),
            "Notification store starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!(
            identities = self.logs.len(),
            "Notification store stopped"
        );
    }

    async fn handle_command(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::Append { record, respond_to } => {
                let result = self.handle_append(record).await;
                // Caller may have given up waiting
                let _ = respond_to.send(result);
            }
            StoreCommand::ListSince {
                identity,
                cursor,
                limit,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_list_since(&identity, cursor, limit));
            }
            StoreCommand::MarkRead {
                identity,
                upto,
                respond_to,
            } => {
                let result = self.handle_mark_read(&identity, upto).await;
                let _ = respond_to.send(result);
            }
            StoreCommand::Prune { now, respond_to } => {
                let report = self.handle_prune(now).await;
                if let Some(tx) = respond_to {
                    let _ = tx.send(report);
                }
            }
            StoreCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    async fn handle_append(&mut self, record: NewNotification) -> Result<Notification, StoreError> {
        let last = self
            .logs
            .get(&record.identity)
            .map_or(Cursor::ZERO, |log| log.last);
        let notification = Notification {
            cursor: last.next(),
            identity: record.identity,
            topic: record.topic,
            event_id: record.event_id,
            payload: record.payload,
            created_at: record.created_at,
            read: false,
        };

        // Commit the cursor only once the write is durable.
        self.backend.append(&notification).await?;

        let log = self.logs.entry(notification.identity.clone()).or_default();
        log.last = notification.cursor;
        log.entries.push_back(notification.clone());

        debug!(
            identity = %notification.identity,
            cursor = %notification.cursor,
            topic = %notification.topic,
            "Notification stored"
        );
        Ok(notification)
    }

    fn handle_list_since(
        &self,
        identity: &IdentityId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<NotificationPage, StoreError> {
        let Some(log) = self.logs.get(identity) else {
            if cursor == Cursor::ZERO {
                return Ok(NotificationPage::default());
            }
            // History this store never had, e.g. after a restart on the
            // memory backend. Resync from the beginning.
            return Err(StoreError::CursorTooOld {
                requested: cursor,
                resume_from: Cursor::ZERO,
            });
        };

        if cursor < log.pruned_through || cursor > log.last {
            return Err(StoreError::CursorTooOld {
                requested: cursor,
                resume_from: log.pruned_through,
            });
        }

        let start = log.entries.partition_point(|n| n.cursor <= cursor);
        let remaining = log.entries.len() - start;
        let items: Vec<Notification> = log.entries.iter().skip(start).take(limit).cloned().collect();

        Ok(NotificationPage {
            has_more: remaining > items.len(),
            items,
        })
    }

    async fn handle_mark_read(&mut self, identity: &IdentityId, upto: Cursor) -> Result<usize, StoreError> {
        let not_owned = || StoreError::CursorNotOwned {
            identity: identity.clone(),
            cursor: upto,
        };

        let log = self.logs.get_mut(identity).ok_or_else(not_owned)?;
        if upto == Cursor::ZERO || upto > log.last {
            return Err(not_owned());
        }

        self.backend.mark_read(identity, upto).await?;
        let updated = log.apply_read(upto);

        debug!(identity = %identity, upto = %upto, updated, "Marked read");
        Ok(updated)
    }

    async fn handle_prune(&mut self, now: DateTime<Utc>) -> PruneReport {
        let cutoff = self.retention.cutoff(now);
        let max = self.retention.max_per_identity;
        let mut report = PruneReport::default();

        for (identity, log) in self.logs.iter_mut() {
            let mut through = None;
            let mut removed = 0;

            while let Some(front) = log.entries.front() {
                let over_count = log.entries.len() > max;
                let expired = cutoff.is_some_and(|c| front.created_at < c);
                if !over_count && !expired {
                    break;
                }
                through = Some(front.cursor);
                log.entries.pop_front();
                removed += 1;
            }

            let Some(through) = through else {
                continue;
            };
            log.pruned_through = through;
            report.identities += 1;
            report.removed += removed;

            let retained: Vec<Notification> = log.entries.iter().cloned().collect();
            if let Err(e) = self.backend.compact(identity, through, &retained).await {
                warn!(identity = %identity, error = %e, "Journal compaction failed");
                // Keep the watermark durable so a restart still reports resync
                if let Err(e) = self.backend.record_pruned(identity, through).await {
                    warn!(identity = %identity, error = %e, "Failed to record prune watermark");
                }
            }
        }

        if report.removed > 0 {
            info!(
                identities = report.identities,
                removed = report.removed,
                "Pruned notification history"
            );
        }
        report
    }

    fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            identities: self.logs.len(),
            ..StoreStats::default()
        };
        for log in self.logs.values() {
            stats.notifications += log.entries.len();
            stats.unread += log.entries.iter().filter(|n| !n.read).count();
        }
        stats
    }
}
