//! Identity to connection mapping.
//!
//! One identity may have any number of live connections (phone, laptop,
//! a second tab). The registry is a pure index; connection lifecycle is
//! owned by the gateway.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use shopcast_core::{ConnectionId, IdentityId};

#[derive(Debug, Default)]
struct SessionIndex {
    by_identity: DashMap<IdentityId, HashSet<ConnectionId>>,
    owner: DashMap<ConnectionId, IdentityId>,
}

/// Concurrent registry of live connections per identity.
///
/// An identity is present only while it has at least one connection.
/// Lock order: `by_identity` shard before `owner` shard; never the reverse.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<SessionIndex>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `conn` as a connection of `identity`. Idempotent.
    ///
    /// Returns `true` if the connection was not yet registered.
    pub fn register(&self, identity: &IdentityId, conn: ConnectionId) -> bool {
        let previous = {
            let mut conns = self.inner.by_identity.entry(identity.clone()).or_default();
            conns.insert(conn);
            self.inner.owner.insert(conn, identity.clone())
        };

        match previous {
            None => {
                debug!(identity = %identity, conn = %conn, "Session registered");
                true
            }
            Some(prev) if prev == *identity => false,
            Some(prev) => {
                // Connection ids are never reused, so this means a caller bug.
                warn!(conn = %conn, from = %prev, to = %identity, "Connection moved between identities");
                self.remove_from_identity(&prev, conn);
                true
            }
        }
    }

    /// Removes `conn`. Returns the identity it belonged to, or `None` if it
    /// was never registered or already removed.
    pub fn deregister(&self, conn: ConnectionId) -> Option<IdentityId> {
        let (_, identity) = self.inner.owner.remove(&conn)?;
        self.remove_from_identity(&identity, conn);
        debug!(identity = %identity, conn = %conn, "Session deregistered");
        Some(identity)
    }

    fn remove_from_identity(&self, identity: &IdentityId, conn: ConnectionId) {
        if let Some(mut conns) = self.inner.by_identity.get_mut(identity) {
            conns.remove(&conn);
        }
        // Rechecked under the shard lock, so a concurrent register wins.
        self.inner
            .by_identity
            .remove_if(identity, |_, conns| conns.is_empty());
    }

    /// Live connections of `identity`, in ascending id order.
    pub fn connections_for(&self, identity: &IdentityId) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self
            .inner
            .by_identity
            .get(identity)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        conns.sort_unstable();
        conns
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<IdentityId> {
        self.inner.owner.get(&conn).map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, identity: &IdentityId) -> bool {
        self.inner.by_identity.contains_key(identity)
    }

    /// Number of identities with at least one connection.
    pub fn identity_count(&self) -> usize {
        self.inner.by_identity.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.owner.len()
    }
}
