//! Topic subscriptions per connection.
//!
//! Two indexes are kept in step: connection to topics (for the per-connection
//! limit and the close cascade) and topic to connections (for routing).
//!
//! Lock order is always the forward (`by_connection`) shard first, then the
//! reverse shard. Readers that only need one side never hold both.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use shopcast_core::{ConnectionId, Topic};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscription limit reached ({max} per connection)")]
    LimitReached { max: usize },

    #[error("Connection {0} is not open")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadySubscribed,
}

#[derive(Debug, Default)]
struct SubscriptionIndex {
    by_connection: DashMap<ConnectionId, HashSet<Topic>>,
    by_topic: DashMap<Topic, HashSet<ConnectionId>>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    inner: Arc<SubscriptionIndex>,
    max_per_connection: usize,
}

impl SubscriptionManager {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            inner: Arc::new(SubscriptionIndex::default()),
            max_per_connection,
        }
    }

    pub fn max_per_connection(&self) -> usize {
        self.max_per_connection
    }

    /// Makes `conn` eligible for subscriptions. Called once the connection
    /// is authenticated.
    pub fn open_connection(&self, conn: ConnectionId) {
        self.inner.by_connection.entry(conn).or_default();
    }

    /// Subscribes `conn` to `topic`. Idempotent.
    ///
    /// # Errors
    ///
    /// - `LimitReached` if `conn` already holds the maximum; nothing changes
    /// - `UnknownConnection` if `conn` was never opened or is already closed
    pub fn subscribe(
        &self,
        conn: ConnectionId,
        topic: &Topic,
    ) -> Result<SubscribeOutcome, SubscriptionError> {
        let mut topics = self
            .inner
            .by_connection
            .get_mut(&conn)
            .ok_or(SubscriptionError::UnknownConnection(conn))?;

        if topics.contains(topic) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        if topics.len() >= self.max_per_connection {
            return Err(SubscriptionError::LimitReached {
                max: self.max_per_connection,
            });
        }

        topics.insert(topic.clone());
        self.inner
            .by_topic
            .entry(topic.clone())
            .or_default()
            .insert(conn);

        debug!(conn = %conn, topic = %topic, "Subscribed");
        Ok(SubscribeOutcome::Added)
    }

    /// Removes one subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, conn: ConnectionId, topic: &Topic) -> bool {
        let Some(mut topics) = self.inner.by_connection.get_mut(&conn) else {
            return false;
        };
        if !topics.remove(topic) {
            return false;
        }
        self.remove_reverse(topic, conn);
        debug!(conn = %conn, topic = %topic, "Unsubscribed");
        true
    }

    /// Drops every subscription of a closed connection and forgets it.
    /// Returns the topics it held.
    pub fn on_connection_closed(&self, conn: ConnectionId) -> Vec<Topic> {
        let Some((_, topics)) = self.inner.by_connection.remove(&conn) else {
            return Vec::new();
        };
        for topic in &topics {
            self.remove_reverse(topic, conn);
        }
        if !topics.is_empty() {
            debug!(conn = %conn, count = topics.len(), "Released subscriptions");
        }
        topics.into_iter().collect()
    }

    fn remove_reverse(&self, topic: &Topic, conn: ConnectionId) {
        if let Some(mut conns) = self.inner.by_topic.get_mut(topic) {
            conns.remove(&conn);
        }
        self.inner
            .by_topic
            .remove_if(topic, |_, conns| conns.is_empty());
    }

    /// Connections subscribed to `topic`, in ascending id order.
    pub fn connections_for(&self, topic: &Topic) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self
            .inner
            .by_topic
            .get(topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        conns.sort_unstable();
        conns
    }

    pub fn is_subscribed(&self, conn: ConnectionId, topic: &Topic) -> bool {
        self.inner
            .by_connection
            .get(&conn)
            .is_some_and(|topics| topics.contains(topic))
    }

    pub fn topics_of(&self, conn: ConnectionId) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .inner
            .by_connection
            .get(&conn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn subscription_count(&self, conn: ConnectionId) -> usize {
        self.inner
            .by_connection
            .get(&conn)
            .map_or(0, |topics| topics.len())
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.by_topic.len()
    }
}
