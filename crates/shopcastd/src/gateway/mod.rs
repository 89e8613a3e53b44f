//! Connection gateway.
//!
//! Owns every live connection: opening it once authenticated, queueing
//! frames to it, dispatching its inbound frames and closing it. Closing
//! cascades into the session registry and the subscription manager, so no
//! other component ever holds a reference to a dead connection.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!   TCP/WebSocket  │  GatewayServer   │  accept, upgrade, authenticate
//!  ───────────────▶│  (per-conn task) │
//!                  └────────┬─────────┘
//!                           │ open / dispatch / close
//!                           ▼
//!                  ┌──────────────────┐      ┌─────────────────────┐
//!   Router ───────▶│     Gateway      │─────▶│ SessionRegistry     │
//!   Heartbeat ────▶│ (connection map) │─────▶│ SubscriptionManager │
//!                  └────────┬─────────┘      │ StoreHandle         │
//!                           │ Outbound       └─────────────────────┘
//!                           ▼
//!                    bounded queue ──▶ writer (sole writer per socket)
//! ```

mod connection;
mod server;

pub use connection::{
    ConnectionHandle, FlowControl, MalformedBudget, Outbound, QueueState, SendError,
};
pub use server::{GatewayServer, HandshakeQuery, ServerError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shopcast_core::{ConnectionId, Cursor, Identity, Topic};
use shopcast_protocol::{ClientFrame, CloseReason, ErrorCode, ProtocolVersion, ServerFrame};

use crate::config::GatewayConfig;
use crate::sessions::SessionRegistry;
use crate::store::{StoreError, StoreHandle};
use crate::subscriptions::{SubscriptionError, SubscriptionManager};

/// Result of queueing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued, but the connection is above its high-water mark.
    Backpressured,
    /// Not queued: unknown, closing or slow connection.
    Dropped,
}

impl Delivery {
    pub fn is_queued(self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

#[derive(Debug)]
struct GatewayState {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    sessions: SessionRegistry,
    subscriptions: SubscriptionManager,
    store: StoreHandle,
    config: GatewayConfig,
    next_id: AtomicU64,
}

/// Shared handle to the connection table.
#[derive(Debug, Clone)]
pub struct Gateway {
    inner: Arc<GatewayState>,
}

/// Topics every connection is subscribed to on activation.
pub fn personal_topics(identity: &Identity) -> [Topic; 2] {
    [Topic::user(&identity.id), Topic::role(identity.role)]
}

impl Gateway {
    pub fn new(
        sessions: SessionRegistry,
        subscriptions: SubscriptionManager,
        store: StoreHandle,
        config: GatewayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayState {
                connections: DashMap::new(),
                sessions,
                subscriptions,
                store,
                config,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Activates an authenticated connection.
    ///
    /// Assigns the id, queues the `connected` frame, registers the session
    /// and subscribes the personal topics. Returns the handle and the
    /// receiving end of its outbound queue.
    pub fn open(
        &self,
        identity: Identity,
        protocol_version: ProtocolVersion,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let flow = FlowControl::from(&self.inner.config);
        let (handle, receiver) = ConnectionHandle::new(id, identity, protocol_version, flow);

        if let Err(e) = handle.activate() {
            error!(conn = %id, error = %e, "Failed to activate connection");
        }

        // First frame on the queue, ahead of anything routed to it.
        let connected = ServerFrame::connected(
            id,
            handle.identity().id.clone(),
            handle.identity().role,
            protocol_version,
        );
        enqueue_frame(&handle, &connected);

        self.inner.connections.insert(id, Arc::clone(&handle));
        self.inner.sessions.register(&handle.identity().id, id);
        self.inner.subscriptions.open_connection(id);
        for topic in personal_topics(handle.identity()) {
            if let Err(e) = self.inner.subscriptions.subscribe(id, &topic) {
                warn!(conn = %id, topic = %topic, error = %e, "Personal topic not subscribed");
            }
        }

        info!(
            conn = %id,
            identity = %handle.identity(),
            version = %protocol_version,
            "Connection opened"
        );
        (handle, receiver)
    }

    /// Closes a connection with `reason`. Idempotent; returns `false` if the
    /// connection was unknown or already closed.
    ///
    /// Removes it from every index before returning. The transport task
    /// flushes what is still queued and sends the close frame.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some((_, handle)) = self.inner.connections.remove(&id) else {
            return false;
        };

        handle.begin_close(reason);
        let released = self.inner.subscriptions.on_connection_closed(id);
        self.inner.sessions.deregister(id);

        info!(
            conn = %id,
            identity = %handle.identity(),
            reason = %reason,
            subscriptions = released.len(),
            "Connection closed"
        );
        true
    }

    /// Closes every connection; used on shutdown.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<ConnectionId> = self.inner.connections.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.close(*id, reason)).count()
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queues a message. A slow consumer is closed on the spot; the caller
    /// is never blocked.
    pub fn send(&self, id: ConnectionId, msg: Outbound) -> Delivery {
        let Some(handle) = self.connection(id) else {
            return Delivery::Dropped;
        };

        match handle.enqueue(msg) {
            Ok(QueueState::Normal) => Delivery::Queued,
            Ok(QueueState::Backpressured) => Delivery::Backpressured,
            Err(SendError::SlowConsumer) => {
                warn!(conn = %id, depth = handle.queue_depth(), "Dropping slow consumer");
                self.close(id, CloseReason::SlowConsumer);
                Delivery::Dropped
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "Frame not queued");
                Delivery::Dropped
            }
        }
    }

    pub fn send_frame(&self, id: ConnectionId, frame: &ServerFrame) -> Delivery {
        match frame.to_json() {
            Ok(json) => self.send(id, Outbound::Text(Arc::from(json))),
            Err(e) => {
                error!(conn = %id, error = %e, "Failed to serialize frame");
                Delivery::Dropped
            }
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner.connections.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of every open connection.
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handles one inbound frame and returns the reply to queue, if any.
    pub async fn dispatch(&self, handle: &ConnectionHandle, frame: ClientFrame) -> Option<ServerFrame> {
        match frame {
            ClientFrame::Auth { .. } => Some(ServerFrame::error(
                ErrorCode::MalformedFrame,
                "already authenticated",
            )),
            ClientFrame::Subscribe { topic } => Some(self.subscribe(handle, topic)),
            ClientFrame::Unsubscribe { topic } => Some(self.unsubscribe(handle, topic)),
            ClientFrame::Ack { cursor } => Some(self.ack(handle, cursor).await),
            ClientFrame::CatchUp { cursor, limit } => {
                Some(self.catch_up(handle, cursor, limit).await)
            }
            ClientFrame::Ping { seq } => Some(ServerFrame::pong(seq)),
            ClientFrame::Pong { .. } => None,
        }
    }

    fn subscribe(&self, handle: &ConnectionHandle, raw: String) -> ServerFrame {
        let topic = match Topic::parse(raw.as_str()) {
            Ok(topic) => topic,
            Err(e) => return ServerFrame::error(ErrorCode::InvalidTopic, &e.to_string()),
        };
        if !topic.permits(handle.identity()) {
            return ServerFrame::error(
                ErrorCode::ForbiddenTopic,
                &format!("{} may not subscribe to {topic}", handle.identity().id),
            );
        }

        match self.inner.subscriptions.subscribe(handle.id(), &topic) {
            Ok(_) => ServerFrame::Subscribed { topic: raw },
            Err(e @ SubscriptionError::LimitReached { .. }) => {
                ServerFrame::error(ErrorCode::SubscriptionLimit, &e.to_string())
            }
            Err(e @ SubscriptionError::UnknownConnection(_)) => {
                ServerFrame::error(ErrorCode::NotAuthenticated, &e.to_string())
            }
        }
    }

    fn unsubscribe(&self, handle: &ConnectionHandle, raw: String) -> ServerFrame {
        match Topic::parse(raw.as_str()) {
            Ok(topic) => {
                self.inner.subscriptions.unsubscribe(handle.id(), &topic);
                ServerFrame::Unsubscribed { topic: raw }
            }
            Err(e) => ServerFrame::error(ErrorCode::InvalidTopic, &e.to_string()),
        }
    }

    async fn ack(&self, handle: &ConnectionHandle, cursor: Cursor) -> ServerFrame {
        match self.inner.store.mark_read(&handle.identity().id, cursor).await {
            Ok(updated) => ServerFrame::Read { cursor, updated },
            Err(e) => store_error_frame(cursor, e),
        }
    }

    /// Reads the connection's identity history after `cursor`.
    pub async fn catch_up(
        &self,
        handle: &ConnectionHandle,
        cursor: Cursor,
        limit: Option<usize>,
    ) -> ServerFrame {
        let config = &self.inner.config;
        let limit = limit
            .unwrap_or(config.catch_up_limit)
            .clamp(1, config.max_catch_up_limit);

        match self
            .inner
            .store
            .list_since(&handle.identity().id, cursor, limit)
            .await
        {
            Ok(page) => {
                debug!(
                    conn = %handle.id(),
                    cursor = %cursor,
                    items = page.items.len(),
                    has_more = page.has_more,
                    "Catch-up"
                );
                ServerFrame::notifications(page.items, page.has_more)
            }
            Err(e) => store_error_frame(cursor, e),
        }
    }
}

fn store_error_frame(cursor: Cursor, err: StoreError) -> ServerFrame {
    match err {
        StoreError::CursorTooOld {
            requested,
            resume_from,
        } => ServerFrame::cursor_too_old(requested, resume_from),
        StoreError::CursorNotOwned { .. } => {
            ServerFrame::error(ErrorCode::CursorNotOwned, &err.to_string())
        }
        StoreError::Backend(_) | StoreError::ChannelClosed => {
            warn!(cursor = %cursor, error = %err, "Store unavailable");
            ServerFrame::error(ErrorCode::StoreUnavailable, "notification store unavailable")
        }
    }
}

fn enqueue_frame(handle: &ConnectionHandle, frame: &ServerFrame) {
    match frame.to_json() {
        Ok(json) => {
            if let Err(e) = handle.enqueue(Outbound::Text(Arc::from(json))) {
                warn!(conn = %handle.id(), error = %e, "Failed to queue frame");
            }
        }
        Err(e) => error!(conn = %handle.id(), error = %e, "Failed to serialize frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{spawn_store, MemoryBackend, NewNotification, Retention};
    use chrono::Utc;
    use serde_json::json;
    use shopcast_core::{ConnectionState, EventId, IdentityId, Role};
    use shopcast_protocol::parse_server_frame;

    async fn create_gateway(config: GatewayConfig) -> Gateway {
        let store = spawn_store(Arc::new(MemoryBackend), Retention::default())
            .await
            .unwrap();
        Gateway::new(
            SessionRegistry::new(),
            SubscriptionManager::new(8),
            store,
            config,
        )
    }

    fn identity(id: &str, role: Role) -> Identity {
        Identity::new(IdentityId::new(id).unwrap(), role)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> ServerFrame {
        match rx.recv().await {
            Some(Outbound::Text(text)) => parse_server_frame(&text).unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_sends_connected_and_subscribes_personal_topics() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let alice = identity("alice", Role::Customer);
        let (handle, mut rx) = gateway.open(alice.clone(), ProtocolVersion::CURRENT);

        assert_eq!(handle.state(), ConnectionState::Active);
        match next_frame(&mut rx).await {
            ServerFrame::Connected {
                connection_id,
                identity,
                role,
                ..
            } => {
                assert_eq!(connection_id, handle.id());
                assert_eq!(identity, alice.id);
                assert_eq!(role, Role::Customer);
            }
            other => panic!("Expected Connected, got {other:?}"),
        }

        let topics = gateway.subscriptions().topics_of(handle.id());
        assert!(topics.contains(&Topic::user(&alice.id)));
        assert!(topics.contains(&Topic::role(Role::Customer)));
        assert_eq!(gateway.sessions().connections_for(&alice.id), vec![handle.id()]);
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let (a, _ra) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);
        let (b, _rb) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);
        assert_ne!(a.id(), b.id());
        assert_eq!(gateway.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_close_cascades_and_is_idempotent() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let alice = identity("alice", Role::Customer);
        let (handle, _rx) = gateway.open(alice.clone(), ProtocolVersion::CURRENT);
        gateway
            .dispatch(&handle, ClientFrame::subscribe("booking:42"))
            .await;

        assert!(gateway.close(handle.id(), CloseReason::Normal));
        assert!(!gateway.close(handle.id(), CloseReason::Normal));

        assert_eq!(handle.state(), ConnectionState::Closing);
        assert!(gateway.connection(handle.id()).is_none());
        assert!(gateway.subscriptions().topics_of(handle.id()).is_empty());
        assert!(gateway
            .subscriptions()
            .connections_for(&Topic::booking(42))
            .is_empty());
        assert!(!gateway.sessions().is_online(&alice.id));
        assert_eq!(
            gateway.send_frame(handle.id(), &ServerFrame::pong(None)),
            Delivery::Dropped
        );
    }

    #[tokio::test]
    async fn test_dispatch_subscribe_rules() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let (handle, _rx) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);

        let reply = gateway.dispatch(&handle, ClientFrame::subscribe("booking:1")).await;
        assert_eq!(
            reply,
            Some(ServerFrame::Subscribed {
                topic: "booking:1".to_string()
            })
        );

        let reply = gateway.dispatch(&handle, ClientFrame::subscribe("booking 1")).await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Error { code: ErrorCode::InvalidTopic, .. })
        ));

        let reply = gateway.dispatch(&handle, ClientFrame::subscribe("user:bob")).await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Error { code: ErrorCode::ForbiddenTopic, .. })
        ));

        let reply = gateway.dispatch(&handle, ClientFrame::subscribe("role:admin")).await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Error { code: ErrorCode::ForbiddenTopic, .. })
        ));
    }

    #[tokio::test]
    async fn test_personal_topic_with_email_identity_can_be_toggled() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let alice = identity("alice@shop.com", Role::Customer);
        let (handle, _rx) = gateway.open(alice.clone(), ProtocolVersion::CURRENT);
        let personal = Topic::user(&alice.id);
        assert!(gateway.subscriptions().is_subscribed(handle.id(), &personal));

        let reply = gateway
            .dispatch(&handle, ClientFrame::unsubscribe("user:alice@shop.com"))
            .await;
        assert_eq!(
            reply,
            Some(ServerFrame::Unsubscribed {
                topic: "user:alice@shop.com".to_string()
            })
        );
        assert!(!gateway.subscriptions().is_subscribed(handle.id(), &personal));

        let reply = gateway
            .dispatch(&handle, ClientFrame::subscribe("user:alice@shop.com"))
            .await;
        assert_eq!(
            reply,
            Some(ServerFrame::Subscribed {
                topic: "user:alice@shop.com".to_string()
            })
        );
        assert!(gateway.subscriptions().is_subscribed(handle.id(), &personal));
    }

    #[tokio::test]
    async fn test_dispatch_subscription_limit() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let (handle, _rx) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);
        // Two personal topics already held, limit is 8
        for n in 0..6 {
            let reply = gateway
                .dispatch(&handle, ClientFrame::subscribe(format!("booking:{n}")))
                .await;
            assert!(matches!(reply, Some(ServerFrame::Subscribed { .. })));
        }

        let reply = gateway.dispatch(&handle, ClientFrame::subscribe("booking:99")).await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Error { code: ErrorCode::SubscriptionLimit, .. })
        ));
        assert_eq!(gateway.subscriptions().subscription_count(handle.id()), 8);
    }

    #[tokio::test]
    async fn test_dispatch_ping_and_pong() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let (handle, _rx) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);

        assert_eq!(
            gateway.dispatch(&handle, ClientFrame::ping(7)).await,
            Some(ServerFrame::pong(Some(7)))
        );
        assert_eq!(
            gateway.dispatch(&handle, ClientFrame::Pong { seq: None }).await,
            None
        );
    }

    #[tokio::test]
    async fn test_dispatch_ack_and_catch_up() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let alice = identity("alice", Role::Customer);
        for n in 1..=3 {
            gateway
                .store()
                .append(NewNotification {
                    identity: alice.id.clone(),
                    topic: Topic::booking(n),
                    event_id: EventId::new(format!("evt-{n}")),
                    payload: json!({"n": n}),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let (handle, _rx) = gateway.open(alice, ProtocolVersion::CURRENT);

        match gateway.dispatch(&handle, ClientFrame::catch_up(Cursor::new(1), None)).await {
            Some(ServerFrame::Notifications { items, has_more }) => {
                let cursors: Vec<u64> = items.iter().map(|n| n.cursor.get()).collect();
                assert_eq!(cursors, vec![2, 3]);
                assert!(!has_more);
            }
            other => panic!("Expected Notifications, got {other:?}"),
        }

        assert_eq!(
            gateway.dispatch(&handle, ClientFrame::ack(Cursor::new(2))).await,
            Some(ServerFrame::Read {
                cursor: Cursor::new(2),
                updated: 2
            })
        );
    }

    #[tokio::test]
    async fn test_ack_of_foreign_cursor_is_rejected() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let alice = identity("alice", Role::Customer);
        gateway
            .store()
            .append(NewNotification {
                identity: alice.id.clone(),
                topic: Topic::booking(1),
                event_id: EventId::new("evt-1"),
                payload: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let (bob, _rx) = gateway.open(identity("bob", Role::Customer), ProtocolVersion::CURRENT);
        let reply = gateway.dispatch(&bob, ClientFrame::ack(Cursor::new(1))).await;
        assert!(matches!(
            reply,
            Some(ServerFrame::Error { code: ErrorCode::CursorNotOwned, .. })
        ));

        let page = gateway
            .store()
            .list_since(&alice.id, Cursor::ZERO, 10)
            .await
            .unwrap();
        assert!(!page.items[0].read);
    }

    #[tokio::test]
    async fn test_slow_consumer_closed_on_full_queue() {
        let config = GatewayConfig {
            outbound_capacity: 4,
            high_water_mark: 3,
            low_water_mark: 1,
            ..GatewayConfig::default()
        };
        let gateway = create_gateway(config).await;
        let (handle, _rx) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);

        // `connected` already occupies one slot
        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(gateway.send_frame(handle.id(), &ServerFrame::pong(None)));
        }
        assert_eq!(
            outcomes,
            vec![
                Delivery::Queued,
                Delivery::Backpressured,
                Delivery::Backpressured,
                Delivery::Dropped
            ]
        );
        assert_eq!(handle.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(gateway.connection(handle.id()).is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let gateway = create_gateway(GatewayConfig::default()).await;
        let (a, _ra) = gateway.open(identity("alice", Role::Customer), ProtocolVersion::CURRENT);
        let (b, _rb) = gateway.open(identity("bob", Role::Technician), ProtocolVersion::CURRENT);

        assert_eq!(gateway.close_all(CloseReason::Shutdown), 2);
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(b.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(gateway.connection_count(), 0);
        assert_eq!(gateway.sessions().connection_count(), 0);
    }
}
