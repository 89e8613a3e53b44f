//! Per-connection state shared between the transport task, the router and
//! the heartbeat monitor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use shopcast_core::{ConnectionId, ConnectionState, DomainResult, Identity};
use shopcast_protocol::{CloseReason, ProtocolVersion};

use crate::config::GatewayConfig;

/// Message queued for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized server frame.
    Text(Arc<str>),
    /// Liveness probe (a WebSocket ping).
    Probe,
}

/// Queue limits of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub capacity: usize,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    pub grace: Duration,
}

impl From<&GatewayConfig> for FlowControl {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            capacity: config.outbound_capacity,
            high_water_mark: config.high_water_mark,
            low_water_mark: config.low_water_mark,
            grace: config.backpressure_grace(),
        }
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection is {0}")]
    NotDeliverable(ConnectionState),

    /// Queue full, or backpressured past the grace period.
    #[error("Slow consumer")]
    SlowConsumer,

    #[error("Transport writer gone")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Normal,
    Backpressured,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    backpressured_since: Option<Instant>,
    close_reason: Option<CloseReason>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live connection.
///
/// Created once authentication has succeeded, so it starts out
/// `Authenticated`. The outbound queue is bounded; the transport task is
/// its only reader.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    protocol_version: ProtocolVersion,
    opened_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    sender: mpsc::Sender<Outbound>,
    depth: AtomicUsize,
    flow: FlowControl,
    last_activity: Mutex<Instant>,
    /// Set when a probe is sent, cleared by any inbound activity.
    pending_probe: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        protocol_version: ProtocolVersion,
        flow: FlowControl,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(flow.capacity.max(1));
        let handle = Self {
            id,
            identity,
            protocol_version,
            opened_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Authenticated,
                backpressured_since: None,
                close_reason: None,
            }),
            sender,
            depth: AtomicUsize::new(0),
            flow,
            last_activity: Mutex::new(Instant::now()),
            pending_probe: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        (Arc::new(handle), receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.lifecycle).state
    }

    /// Frames queued but not yet written.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// `Authenticated` to `Active`.
    pub fn activate(&self) -> DomainResult<()> {
        let mut lc = lock(&self.lifecycle);
        lc.state = lc.state.transition(ConnectionState::Active)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outbound queue
    // ------------------------------------------------------------------------

    /// Queues a message without blocking.
    ///
    /// Crossing the high-water mark moves the connection to
    /// `Backpressured`. The caller must close the connection on
    /// `SendError::SlowConsumer`.
    pub fn enqueue(&self, msg: Outbound) -> Result<QueueState, SendError> {
        let mut lc = lock(&self.lifecycle);
        if !lc.state.accepts_delivery() {
            return Err(SendError::NotDeliverable(lc.state));
        }
        if lc
            .backpressured_since
            .is_some_and(|since| since.elapsed() >= self.flow.grace)
        {
            return Err(SendError::SlowConsumer);
        }

        // Counted before the send so the writer can never decrement first.
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.sender.try_send(msg) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(match e {
                TrySendError::Full(_) => SendError::SlowConsumer,
                TrySendError::Closed(_) => SendError::Closed,
            });
        }

        if lc.state == ConnectionState::Active && depth >= self.flow.high_water_mark {
            lc.state = ConnectionState::Backpressured;
            lc.backpressured_since = Some(Instant::now());
            warn!(conn = %self.id, depth, "Connection backpressured");
        }

        Ok(match lc.state {
            ConnectionState::Backpressured => QueueState::Backpressured,
            _ => QueueState::Normal,
        })
    }

    /// Called by the writer after each message leaves the queue.
    pub fn mark_written(&self) {
        let depth = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1));

        if depth > self.flow.low_water_mark {
            return;
        }
        let mut lc = lock(&self.lifecycle);
        if lc.state == ConnectionState::Backpressured {
            lc.state = ConnectionState::Active;
            lc.backpressured_since = None;
            info!(conn = %self.id, depth, "Connection recovered from backpressure");
        }
    }

    /// Whether the connection has stayed backpressured past the grace period.
    pub fn backpressure_expired(&self) -> bool {
        lock(&self.lifecycle)
            .backpressured_since
            .is_some_and(|since| since.elapsed() >= self.flow.grace)
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    /// Any inbound frame, including pongs, counts as activity.
    pub fn record_activity(&self) {
        *lock(&self.last_activity) = Instant::now();
        *lock(&self.pending_probe) = None;
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    pub fn record_probe(&self, at: Instant) {
        *lock(&self.pending_probe) = Some(at);
    }

    /// When the outstanding probe was sent, if it is still unanswered.
    pub fn pending_probe(&self) -> Option<Instant> {
        *lock(&self.pending_probe)
    }

    // ------------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------------

    /// Moves to `Closing` and signals the transport task. Returns `false`
    /// if the connection was already closing.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let mut lc = lock(&self.lifecycle);
        match lc.state.transition(ConnectionState::Closing) {
            Ok(next) => {
                lc.state = next;
                lc.close_reason = Some(reason);
                self.cancel.cancel();
                true
            }
            Err(_) => false,
        }
    }

    /// Transport released.
    pub fn mark_closed(&self) {
        let mut lc = lock(&self.lifecycle);
        if let Ok(next) = lc.state.transition(ConnectionState::Closed) {
            lc.state = next;
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.lifecycle).close_reason
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Sliding-window count of malformed inbound frames.
#[derive(Debug)]
pub struct MalformedBudget {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl MalformedBudget {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: VecDeque::new(),
        }
    }

    /// Records one malformed frame. Returns `true` once `limit` frames
    /// fall within the window.
    pub fn record(&mut self, now: Instant) -> bool {
        self.hits.push_back(now);
        while self
            .hits
            .front()
            .is_some_and(|&at| now.duration_since(at) >= self.window)
        {
            self.hits.pop_front();
        }
        self.hits.len() >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopcast_core::{IdentityId, Role};

    fn flow(capacity: usize, high: usize, low: usize) -> FlowControl {
        FlowControl {
            capacity,
            high_water_mark: high,
            low_water_mark: low,
            grace: Duration::from_secs(5),
        }
    }

    fn create_handle(flow: FlowControl) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let identity = Identity::new(IdentityId::new("alice").unwrap(), Role::Customer);
        ConnectionHandle::new(ConnectionId::new(1), identity, ProtocolVersion::CURRENT, flow)
    }

    fn text(s: &str) -> Outbound {
        Outbound::Text(Arc::from(s))
    }

    #[test]
    fn test_not_deliverable_before_activation() {
        let (handle, _rx) = create_handle(flow(8, 4, 1));
        assert_eq!(handle.state(), ConnectionState::Authenticated);
        assert_eq!(
            handle.enqueue(text("x")),
            Err(SendError::NotDeliverable(ConnectionState::Authenticated))
        );

        handle.activate().unwrap();
        assert_eq!(handle.enqueue(text("x")), Ok(QueueState::Normal));
        assert_eq!(handle.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_enter_and_recover() {
        let (handle, mut rx) = create_handle(flow(8, 3, 1));
        handle.activate().unwrap();

        assert_eq!(handle.enqueue(text("1")), Ok(QueueState::Normal));
        assert_eq!(handle.enqueue(text("2")), Ok(QueueState::Normal));
        assert_eq!(handle.enqueue(text("3")), Ok(QueueState::Backpressured));
        assert_eq!(handle.state(), ConnectionState::Backpressured);
        // Still deliverable while backpressured
        assert_eq!(handle.enqueue(text("4")), Ok(QueueState::Backpressured));

        for _ in 0..3 {
            rx.recv().await.unwrap();
            handle.mark_written();
        }
        assert_eq!(handle.queue_depth(), 1);
        assert_eq!(handle.state(), ConnectionState::Active);
    }

    #[test]
    fn test_full_queue_is_slow_consumer() {
        let (handle, _rx) = create_handle(flow(2, 2, 1));
        handle.activate().unwrap();
        handle.enqueue(text("1")).unwrap();
        handle.enqueue(text("2")).unwrap();
        assert_eq!(handle.enqueue(text("3")), Err(SendError::SlowConsumer));
        assert_eq!(handle.queue_depth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_grace_expires() {
        let (handle, _rx) = create_handle(flow(16, 2, 1));
        handle.activate().unwrap();
        handle.enqueue(text("1")).unwrap();
        handle.enqueue(text("2")).unwrap();
        assert!(!handle.backpressure_expired());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(handle.backpressure_expired());
        assert_eq!(handle.enqueue(text("3")), Err(SendError::SlowConsumer));
    }

    #[test]
    fn test_closed_writer() {
        let (handle, rx) = create_handle(flow(4, 3, 1));
        handle.activate().unwrap();
        drop(rx);
        assert_eq!(handle.enqueue(text("1")), Err(SendError::Closed));
        assert_eq!(handle.queue_depth(), 0);
    }

    #[test]
    fn test_begin_close_once() {
        let (handle, _rx) = create_handle(flow(4, 3, 1));
        handle.activate().unwrap();

        assert!(handle.begin_close(CloseReason::HeartbeatTimeout));
        assert!(!handle.begin_close(CloseReason::Normal));
        assert_eq!(handle.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(handle.is_closing());
        assert_eq!(
            handle.enqueue(text("late")),
            Err(SendError::NotDeliverable(ConnectionState::Closing))
        );

        handle.mark_closed();
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_activity_clears_probe() {
        let (handle, _rx) = create_handle(flow(4, 3, 1));
        handle.record_probe(Instant::now());
        assert!(handle.pending_probe().is_some());
        handle.record_activity();
        assert!(handle.pending_probe().is_none());
    }

    #[test]
    fn test_malformed_budget_window() {
        let mut budget = MalformedBudget::new(3, Duration::from_secs(10));
        let start = Instant::now();

        assert!(!budget.record(start));
        assert!(!budget.record(start + Duration::from_secs(1)));
        // Both earlier hits have aged out of the window
        assert!(!budget.record(start + Duration::from_secs(11)));
        assert!(!budget.record(start + Duration::from_secs(12)));
        assert!(budget.record(start + Duration::from_secs(13)));
    }
}
