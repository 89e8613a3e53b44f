//! WebSocket server for the gateway.
//!
//! Each accepted TCP stream is upgraded to a WebSocket, authenticated and
//! then served by one task that is the sole writer of its socket:
//!
//! 1. Upgrade. Query parameters `token`, `cursor` and `v` are captured.
//! 2. Authenticate, from the query token or a first `auth` frame.
//! 3. `Gateway::open`, then an immediate catch-up if a cursor was given.
//! 4. Pump the outbound queue and dispatch inbound frames until closed.
//! 5. Flush what is queued, send the close frame, release the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shopcast_core::{Cursor, Identity};
use shopcast_protocol::{parse_client_frame, ClientFrame, CloseReason, ErrorCode, ProtocolVersion, ServerFrame};

use super::{ConnectionHandle, Gateway, MalformedBudget, Outbound};
use crate::auth::AuthVerifier;

/// Write timeout per frame (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for open connection tasks to finish after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}

// ============================================================================
// Handshake
// ============================================================================

/// Parameters captured from the upgrade request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeQuery {
    pub token: Option<String>,
    pub cursor: Option<Cursor>,
    pub version: Option<String>,
}

impl HandshakeQuery {
    /// Parses `token=...&cursor=...&v=...`. Unknown keys are ignored.
    pub fn parse(query: &str) -> Self {
        let mut out = Self::default();
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "token" if !value.is_empty() => out.token = Some(value.to_string()),
                "cursor" => out.cursor = value.parse::<u64>().ok().map(Cursor::new),
                "v" | "version" if !value.is_empty() => out.version = Some(value.to_string()),
                _ => {}
            }
        }
        out
    }
}

#[derive(Debug)]
struct Credentials {
    token: String,
    cursor: Option<Cursor>,
    version: Option<ProtocolVersion>,
}

#[derive(Debug)]
struct Rejection {
    reason: CloseReason,
    detail: String,
}

impl Rejection {
    fn new(reason: CloseReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accepts WebSocket connections for a [`Gateway`].
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Gateway,
    auth: Arc<dyn AuthVerifier>,
    cancel_token: CancellationToken,
}

impl GatewayServer {
    /// Binds the listen address. Use port 0 to pick a free port.
    pub async fn bind(
        addr: &str,
        gateway: Gateway,
        auth: Arc<dyn AuthVerifier>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            gateway,
            auth,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::LocalAddr)
    }

    /// Accepts connections until the cancellation token fires, then closes
    /// every connection with `server-shutdown`.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway listening");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    info!("Gateway shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = self.gateway.clone();
                            let auth = Arc::clone(&self.auth);
                            tasks.spawn(serve_connection(stream, peer, gateway, auth));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }

            // Reap finished connection tasks
            while tasks.try_join_next().is_some() {}
        }

        let closed = self.gateway.close_all(CloseReason::Shutdown);
        info!(connections = closed, "Closing connections for shutdown");

        let drain = async { while tasks.join_next().await.is_some() {} };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(remaining = tasks.len(), "Connections still open after shutdown grace");
            tasks.abort_all();
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Gateway,
    auth: Arc<dyn AuthVerifier>,
) {
    let deadline = Instant::now() + gateway.config().handshake_timeout();

    let mut query = HandshakeQuery::default();
    let upgrade = accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = HandshakeQuery::parse(req.uri().query().unwrap_or_default());
        Ok::<Response, ErrorResponse>(resp)
    });
    let mut ws = match timeout_at(deadline, upgrade).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "WebSocket upgrade failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "WebSocket upgrade timed out");
            return;
        }
    };

    let (identity, credentials, version) = match authenticate(&mut ws, query, &*auth, deadline).await {
        Ok(Some(accepted)) => accepted,
        Ok(None) => {
            debug!(peer = %peer, "Peer left during handshake");
            return;
        }
        Err(rejection) => {
            info!(
                peer = %peer,
                reason = %rejection.reason,
                detail = %rejection.detail,
                "Handshake rejected"
            );
            reject(&mut ws, &rejection).await;
            return;
        }
    };

    let (handle, receiver) = gateway.open(identity, version);
    debug!(conn = %handle.id(), peer = %peer, "Connection established");

    if let Some(cursor) = credentials.cursor {
        let reply = gateway.catch_up(&handle, cursor, None).await;
        gateway.send_frame(handle.id(), &reply);
    }

    run_connection(&gateway, &handle, ws, receiver).await;
}

type Accepted = (Identity, Credentials, ProtocolVersion);

/// Resolves credentials, negotiates the version and verifies the token.
/// `Ok(None)` means the peer disconnected first.
async fn authenticate(
    ws: &mut WebSocketStream<TcpStream>,
    query: HandshakeQuery,
    auth: &dyn AuthVerifier,
    deadline: Instant,
) -> Result<Option<Accepted>, Rejection> {
    let credentials = match query.token {
        Some(token) => {
            let version = query
                .version
                .as_deref()
                .map(ProtocolVersion::parse)
                .transpose()
                .map_err(|e| Rejection::new(CloseReason::VersionMismatch, e.to_string()))?;
            Credentials {
                token,
                cursor: query.cursor,
                version,
            }
        }
        None => match timeout_at(deadline, read_auth_frame(ws)).await {
            Ok(Ok(Some(credentials))) => credentials,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(rejection)) => return Err(rejection),
            Err(_) => {
                return Err(Rejection::new(
                    CloseReason::HandshakeTimeout,
                    "no auth frame before the handshake deadline",
                ))
            }
        },
    };

    let version = ProtocolVersion::negotiate(credentials.version)
        .map_err(|e| Rejection::new(CloseReason::VersionMismatch, e.to_string()))?;

    let identity = match timeout_at(deadline, auth.verify(&credentials.token)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => return Err(Rejection::new(CloseReason::AuthFailed, e.to_string())),
        Err(_) => {
            return Err(Rejection::new(
                CloseReason::HandshakeTimeout,
                "token verification timed out",
            ))
        }
    };

    Ok(Some((identity, credentials, version)))
}

/// Waits for the first data frame, which must be `auth`.
async fn read_auth_frame(
    ws: &mut WebSocketStream<TcpStream>,
) -> Result<Option<Credentials>, Rejection> {
    while let Some(msg) = ws.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return Ok(None),
            Ok(Message::Binary(_)) => {
                return Err(Rejection::new(CloseReason::AuthFailed, "expected an auth frame"))
            }
            Ok(_) => continue,
        };

        return match parse_client_frame(text.as_str()) {
            Ok(ClientFrame::Auth {
                token,
                cursor,
                protocol_version,
            }) => Ok(Some(Credentials {
                token,
                cursor,
                version: protocol_version,
            })),
            Ok(_) => Err(Rejection::new(
                CloseReason::AuthFailed,
                "expected an auth frame",
            )),
            Err(e) => Err(Rejection::new(CloseReason::AuthFailed, e.to_string())),
        };
    }
    Ok(None)
}

async fn reject(ws: &mut WebSocketStream<TcpStream>, rejection: &Rejection) {
    let frame = ServerFrame::rejected(&rejection.detail, rejection.reason.code());
    if let Ok(json) = frame.to_json() {
        let _ = timeout(WRITE_TIMEOUT, ws.send(Message::text(json))).await;
    }
    let _ = timeout(WRITE_TIMEOUT, ws.close(Some(close_frame(rejection.reason)))).await;
}

// ============================================================================
// Connection loop
// ============================================================================

async fn run_connection(
    gateway: &Gateway,
    handle: &Arc<ConnectionHandle>,
    ws: WebSocketStream<TcpStream>,
    mut receiver: mpsc::Receiver<Outbound>,
) {
    let config = gateway.config().clone();
    let (mut sink, mut stream) = ws.split();
    let mut malformed =
        MalformedBudget::new(config.malformed_frame_limit, config.malformed_frame_window());

    let check_every = (config.backpressure_grace() / 4).max(Duration::from_millis(10));
    let mut backpressure_check = interval(check_every);
    backpressure_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;

            _ = handle.cancelled() => {
                break handle.close_reason().unwrap_or(CloseReason::Normal);
            }

            outbound = receiver.recv() => {
                let Some(msg) = outbound else {
                    break CloseReason::Normal;
                };
                let written = write_outbound(&mut sink, msg).await;
                handle.mark_written();
                if let Err(e) = written {
                    debug!(conn = %handle.id(), error = %e, "Write failed");
                    break CloseReason::Normal;
                }
            }

            inbound = stream.next() => {
                if let Some(reason) = handle_inbound(gateway, handle, &mut malformed, inbound).await {
                    break reason;
                }
            }

            _ = backpressure_check.tick() => {
                if handle.backpressure_expired() {
                    break CloseReason::SlowConsumer;
                }
            }
        }
    };

    gateway.close(handle.id(), reason);
    let reason = handle.close_reason().unwrap_or(reason);

    if !matches!(reason, CloseReason::SlowConsumer | CloseReason::HeartbeatTimeout) {
        let flush = async {
            while let Ok(msg) = receiver.try_recv() {
                let written = write_outbound(&mut sink, msg).await;
                handle.mark_written();
                if written.is_err() {
                    break;
                }
            }
        };
        if timeout(config.flush_timeout(), flush).await.is_err() {
            debug!(conn = %handle.id(), "Flush timed out during close");
        }
    }

    let _ = timeout(
        WRITE_TIMEOUT,
        sink.send(Message::Close(Some(close_frame(reason)))),
    )
    .await;
    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
    handle.mark_closed();
    debug!(conn = %handle.id(), reason = %reason, "Transport released");
}

/// Returns a close reason when the connection must end.
async fn handle_inbound(
    gateway: &Gateway,
    handle: &ConnectionHandle,
    malformed: &mut MalformedBudget,
    inbound: Option<Result<Message, WsError>>,
) -> Option<CloseReason> {
    let text = match inbound {
        Some(Ok(Message::Text(text))) => {
            handle.record_activity();
            text
        }
        Some(Ok(Message::Binary(_))) => {
            handle.record_activity();
            return report_malformed(
                gateway,
                handle,
                malformed,
                ServerFrame::error(ErrorCode::MalformedFrame, "binary frames are not supported"),
            );
        }
        Some(Ok(Message::Close(_))) | None => return Some(CloseReason::Normal),
        Some(Ok(_)) => {
            // Ping, pong, raw frames
            handle.record_activity();
            return None;
        }
        Some(Err(e)) => {
            debug!(conn = %handle.id(), error = %e, "Read failed");
            return Some(CloseReason::Normal);
        }
    };

    match parse_client_frame(text.as_str()) {
        Ok(frame) => {
            if let Some(reply) = gateway.dispatch(handle, frame).await {
                gateway.send_frame(handle.id(), &reply);
            }
            None
        }
        Err(e) => {
            let reply = ServerFrame::error(e.code(), &e.to_string());
            report_malformed(gateway, handle, malformed, reply)
        }
    }
}

fn report_malformed(
    gateway: &Gateway,
    handle: &ConnectionHandle,
    malformed: &mut MalformedBudget,
    reply: ServerFrame,
) -> Option<CloseReason> {
    gateway.send_frame(handle.id(), &reply);
    if malformed.record(Instant::now()) {
        warn!(conn = %handle.id(), identity = %handle.identity(), "Too many malformed frames");
        return Some(CloseReason::TooManyMalformedFrames);
    }
    None
}

async fn write_outbound(sink: &mut WsSink, msg: Outbound) -> Result<(), WsError> {
    let message = match msg {
        Outbound::Text(text) => Message::text(text.to_string()),
        Outbound::Probe => Message::Ping(Default::default()),
    };
    match timeout(WRITE_TIMEOUT, sink.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(WsError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write timeout",
        ))),
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.as_str().to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let q = HandshakeQuery::parse("token=abc.def&cursor=41&v=1.0&extra=1");
        assert_eq!(q.token.as_deref(), Some("abc.def"));
        assert_eq!(q.cursor, Some(Cursor::new(41)));
        assert_eq!(q.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_parse_query_empty_and_invalid() {
        assert_eq!(HandshakeQuery::parse(""), HandshakeQuery::default());

        let q = HandshakeQuery::parse("token=&cursor=abc");
        assert_eq!(q.token, None);
        assert_eq!(q.cursor, None);
    }

    #[test]
    fn test_close_frame_codes() {
        let frame = close_frame(CloseReason::HeartbeatTimeout);
        assert_eq!(u16::from(frame.code), 4009);
        assert_eq!(frame.reason.as_str(), "heartbeat-timeout");
    }
}
