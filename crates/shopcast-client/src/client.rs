//! Reconnecting notification client.
//!
//! [`NotificationClient`] keeps one WebSocket connection to the daemon open:
//! - Authenticates with a first `auth` frame carrying the resume cursor
//! - Restores topic subscriptions after every reconnect
//! - Pages through catch-up batches and follows `cursor_too_old` resyncs
//! - Reports each event once, whether it arrives live or in a replay
//! - Reconnects with exponential backoff until cancelled or refused

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shopcast_core::{ConnectionId, Cursor, EventId, IdentityId, Notification, Role};
use shopcast_protocol::{
    parse_server_frame, ClientFrame, CloseReason, ErrorCode, ProtocolVersion, ServerFrame,
};

use crate::error::{ClientError, Result};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How many delivered event ids are remembered for de-duplication.
const RECENT_EVENTS: usize = 1024;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9470/`.
    pub url: String,

    /// Bearer token sent in the `auth` frame.
    pub token: String,

    /// Topics subscribed on every connection, besides the personal ones the
    /// server adds.
    pub topics: Vec<String>,

    /// Cursor to catch up from on the first connection. Later connections
    /// resume from the last cursor seen.
    pub resume_from: Option<Cursor>,

    /// Page size for catch-up requests; the server default when `None`.
    pub catch_up_limit: Option<usize>,

    /// Limit for connecting plus the auth round trip.
    pub handshake_timeout: Duration,

    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,

    /// Backoff factor applied after each failed attempt.
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9470/".to_string(),
            token: String::new(),
            topics: Vec::new(),
            resume_from: None,
            catch_up_limit: None,
            handshake_timeout: Duration::from_secs(5),
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

/// Delay after `delay`, growing by `multiplier` and capped at `max`.
pub fn next_delay(delay: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier.max(1.0))
        .unwrap_or(max)
        .min(max)
}

// ============================================================================
// Events and commands
// ============================================================================

/// What the client reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected {
        connection_id: ConnectionId,
        identity: IdentityId,
        role: Role,
        protocol_version: ProtocolVersion,
    },

    /// Live event.
    Event {
        event_id: EventId,
        topic: String,
        payload: serde_json::Value,
    },

    /// Replayed notification whose event was not already reported.
    Notification(Notification),

    Read {
        cursor: Cursor,
        updated: usize,
    },

    /// History before `oldest_cursor` was pruned; the client resumed from
    /// there. Anything older is lost.
    Resync {
        oldest_cursor: Cursor,
    },

    Error {
        code: ErrorCode,
        message: String,
    },

    /// The connection ended; `code` is the close code when one was sent.
    Disconnected {
        code: Option<u16>,
    },
}

/// Requests from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
    /// Mark everything up to the cursor as read.
    Ack(Cursor),
    CatchUp {
        cursor: Cursor,
        limit: Option<usize>,
    },
}

// ============================================================================
// Resume state
// ============================================================================

/// Bounded set of recently delivered event ids.
#[derive(Debug, Default)]
struct RecentEvents {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
}

impl RecentEvents {
    /// Returns `false` if `id` was already recorded.
    fn insert(&mut self, id: EventId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.order.len() == RECENT_EVENTS {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.ids.insert(id);
        true
    }
}

/// What survives a reconnect.
#[derive(Debug, Default)]
struct ResumeState {
    last_cursor: Option<Cursor>,
    topics: BTreeSet<String>,
    seen: RecentEvents,
}

impl ResumeState {
    fn new(topics: &[String]) -> Self {
        Self {
            topics: topics.iter().cloned().collect(),
            ..Self::default()
        }
    }

    fn advance(&mut self, cursor: Cursor) {
        if self.last_cursor.map_or(true, |last| cursor > last) {
            self.last_cursor = Some(cursor);
        }
    }
}

/// One inbound message during the handshake or the session.
enum Incoming {
    Frame(ServerFrame),
    Closed { code: Option<u16>, reason: String },
}

// ============================================================================
// Client
// ============================================================================

pub struct NotificationClient {
    config: ClientConfig,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    command_rx: Mutex<mpsc::UnboundedReceiver<ClientCommand>>,
    cancel_token: CancellationToken,
}

impl NotificationClient {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
        command_rx: mpsc::UnboundedReceiver<ClientCommand>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            command_rx: Mutex::new(command_rx),
            cancel_token,
        }
    }

    /// Keeps a connection open until cancelled.
    ///
    /// # Errors
    ///
    /// Returns when the server refuses the handshake or closes with a code
    /// that forbids reconnecting (bad token, incompatible version).
    pub async fn run(&self) -> Result<()> {
        info!(url = %self.config.url, "Notification client starting");

        let mut state = ResumeState::new(&self.config.topics);
        let mut delay = self.config.retry_initial_delay;
        let mut first = true;

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Notification client shutting down");
                return Ok(());
            }

            let cursor = if first {
                self.config.resume_from
            } else {
                Some(state.last_cursor.unwrap_or(Cursor::ZERO))
            };

            let attempt = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Ok(()),
                attempt = self.open(cursor) => attempt,
            };

            match attempt {
                Ok(ws) => {
                    first = false;
                    delay = self.config.retry_initial_delay;

                    let outcome = self.serve(ws, &mut state).await;
                    let code = match &outcome {
                        Ok(code) => *code,
                        Err(ClientError::Closed { code, .. }) => Some(*code),
                        Err(_) => None,
                    };
                    self.emit(ClientEvent::Disconnected { code });

                    match outcome {
                        Ok(_) => debug!(code, "Connection ended"),
                        Err(e) if !e.is_retryable() => {
                            error!(error = %e, "Server refused further connections");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "Connection ended with error"),
                    }
                }
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, "Handshake refused");
                    return Err(e);
                }
                Err(e) => debug!(error = %e, "Connection attempt failed"),
            }

            tokio::select! {
                _ = sleep(delay) => {
                    delay = next_delay(delay, self.config.retry_multiplier, self.config.retry_max_delay);
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Notification client shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The application may have stopped listening
        let _ = self.event_tx.send(event);
    }

    /// Connects and authenticates.
    async fn open(&self, cursor: Option<Cursor>) -> Result<Ws> {
        let limit = self.config.handshake_timeout;
        let connect_error = |reason: String| ClientError::Connect {
            url: self.config.url.clone(),
            reason,
        };

        let (mut ws, _) = timeout(limit, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| connect_error("timed out".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;

        let auth = ClientFrame::Auth {
            token: self.config.token.clone(),
            cursor,
            protocol_version: Some(ProtocolVersion::CURRENT),
        };
        send_frame(&mut ws, &auth).await?;

        let reply = timeout(limit, next_incoming(&mut ws))
            .await
            .map_err(|_| ClientError::Protocol("no handshake reply".to_string()))??;

        match reply {
            Incoming::Frame(ServerFrame::Connected {
                connection_id,
                identity,
                role,
                protocol_version,
            }) => {
                info!(
                    conn = %connection_id,
                    identity = %identity,
                    protocol_version = %protocol_version,
                    "Connected"
                );
                self.emit(ClientEvent::Connected {
                    connection_id,
                    identity,
                    role,
                    protocol_version,
                });
                Ok(ws)
            }
            Incoming::Frame(ServerFrame::Rejected { reason, code, .. }) => {
                Err(ClientError::Rejected { code, reason })
            }
            Incoming::Frame(other) => Err(ClientError::Protocol(format!(
                "unexpected handshake reply: {other:?}"
            ))),
            Incoming::Closed { code, reason } => match code {
                Some(code) if !is_retryable_close(code) => Err(ClientError::Rejected { code, reason }),
                _ => Err(ClientError::Protocol(format!(
                    "closed during handshake: {reason}"
                ))),
            },
        }
    }

    /// Serves one authenticated connection. Returns the close code when the
    /// server ended it normally.
    async fn serve(&self, mut ws: Ws, state: &mut ResumeState) -> Result<Option<u16>> {
        for topic in &state.topics {
            send_frame(&mut ws, &ClientFrame::subscribe(topic.as_str())).await?;
        }

        let mut command_rx = self.command_rx.lock().await;
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(None);
                }

                incoming = next_incoming(&mut ws) => {
                    match incoming? {
                        Incoming::Frame(frame) => {
                            if let Some(reply) = self.handle_frame(frame, state) {
                                send_frame(&mut ws, &reply).await?;
                            }
                        }
                        Incoming::Closed { code: Some(code), reason } if !is_retryable_close(code) => {
                            return Err(ClientError::Closed { code, reason });
                        }
                        Incoming::Closed { code, reason } => {
                            info!(code, reason = %reason, "Server closed connection");
                            return Ok(code);
                        }
                    }
                }

                command = command_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            let frame = apply_command(command, state);
                            send_frame(&mut ws, &frame).await?;
                        }
                        None => {
                            debug!("Command channel closed");
                            commands_open = false;
                        }
                    }
                }
            }
        }
    }

    /// Updates resume state and returns a follow-up request, if any.
    fn handle_frame(&self, frame: ServerFrame, state: &mut ResumeState) -> Option<ClientFrame> {
        match frame {
            ServerFrame::Event {
                event_id,
                topic,
                payload,
                ..
            } => {
                if state.seen.insert(event_id.clone()) {
                    self.emit(ClientEvent::Event {
                        event_id,
                        topic,
                        payload,
                    });
                }
                None
            }
            ServerFrame::Notifications { items, has_more } => {
                debug!(items = items.len(), has_more, "Catch-up batch");
                for notification in items {
                    state.advance(notification.cursor);
                    if state.seen.insert(notification.event_id.clone()) {
                        self.emit(ClientEvent::Notification(notification));
                    }
                }
                match (has_more, state.last_cursor) {
                    (true, Some(cursor)) => {
                        Some(ClientFrame::catch_up(cursor, self.config.catch_up_limit))
                    }
                    _ => None,
                }
            }
            ServerFrame::Read { cursor, updated } => {
                self.emit(ClientEvent::Read { cursor, updated });
                None
            }
            ServerFrame::Error {
                code: ErrorCode::CursorTooOld,
                oldest_cursor: Some(oldest),
                ..
            } => {
                warn!(oldest_cursor = %oldest, "History pruned past our cursor, resyncing");
                state.last_cursor = Some(oldest);
                self.emit(ClientEvent::Resync {
                    oldest_cursor: oldest,
                });
                Some(ClientFrame::catch_up(oldest, self.config.catch_up_limit))
            }
            ServerFrame::Error { code, message, .. } => {
                warn!(code = %code, message = %message, "Server reported an error");
                self.emit(ClientEvent::Error { code, message });
                None
            }
            ServerFrame::Subscribed { topic } => {
                debug!(topic = %topic, "Subscribed");
                None
            }
            ServerFrame::Unsubscribed { topic } => {
                debug!(topic = %topic, "Unsubscribed");
                None
            }
            ServerFrame::Pong { seq } => {
                debug!(seq, "Pong");
                None
            }
            ServerFrame::Connected { .. } | ServerFrame::Rejected { .. } => {
                warn!("Handshake frame received after connecting");
                None
            }
        }
    }
}

fn apply_command(command: ClientCommand, state: &mut ResumeState) -> ClientFrame {
    match command {
        ClientCommand::Subscribe(topic) => {
            state.topics.insert(topic.clone());
            ClientFrame::subscribe(topic)
        }
        ClientCommand::Unsubscribe(topic) => {
            state.topics.remove(&topic);
            ClientFrame::unsubscribe(topic)
        }
        ClientCommand::Ack(cursor) => ClientFrame::ack(cursor),
        ClientCommand::CatchUp { cursor, limit } => ClientFrame::catch_up(cursor, limit),
    }
}

fn is_retryable_close(code: u16) -> bool {
    CloseReason::from_code(code).map_or(true, |reason| reason.is_retryable())
}

async fn send_frame(ws: &mut Ws, frame: &ClientFrame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    ws.send(Message::text(json)).await?;
    Ok(())
}

/// Next data frame or the close. Control frames are answered by the
/// WebSocket layer and skipped.
async fn next_incoming(ws: &mut Ws) -> Result<Incoming> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                let frame = parse_server_frame(text.as_str())
                    .map_err(|e| ClientError::Protocol(e.to_string()))?;
                return Ok(Incoming::Frame(frame));
            }
            Message::Close(frame) => {
                return Ok(match frame {
                    Some(frame) => Incoming::Closed {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.as_str().to_string(),
                    },
                    None => Incoming::Closed {
                        code: None,
                        reason: String::new(),
                    },
                });
            }
            Message::Binary(_) => {
                return Err(ClientError::Protocol("unexpected binary frame".to_string()));
            }
            _ => {}
        }
    }
    Ok(Incoming::Closed {
        code: None,
        reason: "connection ended".to_string(),
    })
}
