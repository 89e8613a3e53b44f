//! Shared helpers for integration tests: a running service on an ephemeral
//! port and a WebSocket test client.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use shopcast_core::{ConnectionId, Identity, IdentityId, Role};
use shopcast_protocol::{parse_server_frame, ClientFrame, ServerFrame};
use shopcastd::auth::{issue_token, VerifierChain};
use shopcastd::config::ServiceConfig;
use shopcastd::Service;

// ============================================================================
// Constants
// ============================================================================

pub const SECRET: &str = "integration-test-secret-0123456789";

/// Maximum wait for one expected frame
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Window in which an unexpected frame would show up
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Service
// ============================================================================

pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.auth.jwt_secret = Some(SECRET.to_string());
    config
}

pub struct TestService {
    pub service: Service,
    pub cancel_token: CancellationToken,
}

impl TestService {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: ServiceConfig) -> Self {
        let auth = VerifierChain::from_config(&config.auth).expect("build verifiers");
        let cancel_token = CancellationToken::new();
        let service = Service::start(&config, Arc::new(auth), cancel_token.clone())
            .await
            .expect("start service");
        Self {
            service,
            cancel_token,
        }
    }

    pub fn url(&self, query: &str) -> String {
        let addr = self.service.local_addr();
        if query.is_empty() {
            format!("ws://{addr}/")
        } else {
            format!("ws://{addr}/?{query}")
        }
    }

    /// Connects with a fresh token for `id` and returns the client and its
    /// connection id.
    pub async fn connect_as(&self, id: &str, role: Role) -> (TestClient, ConnectionId) {
        let query = format!("token={}", token_for(id, role));
        self.connect_with_query(&query).await
    }

    /// Connects with a query string and expects a `connected` reply.
    pub async fn connect_with_query(&self, query: &str) -> (TestClient, ConnectionId) {
        let mut client = TestClient::connect(&self.url(query)).await;
        match client.recv().await {
            ServerFrame::Connected { connection_id, .. } => (client, connection_id),
            other => panic!("expected connected, got {other:?}"),
        }
    }

    pub async fn stop(self) {
        self.service.shutdown();
        timeout(Duration::from_secs(10), self.service.join())
            .await
            .expect("service stops in time")
            .expect("service stops cleanly");
    }
}

pub fn token_for(id: &str, role: Role) -> String {
    let identity = Identity::new(IdentityId::new(id).unwrap(), role);
    issue_token(SECRET.as_bytes(), &identity, Duration::from_secs(300)).unwrap()
}

pub fn identity_id(id: &str) -> IdentityId {
    IdentityId::new(id).unwrap()
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < within {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}

// ============================================================================
// Client
// ============================================================================

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        Self { ws }
    }

    pub async fn send(&mut self, frame: ClientFrame) {
        let json = serde_json::to_string(&frame).unwrap();
        self.send_text(&json).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.expect("send");
    }

    /// Next data frame; control frames are skipped.
    pub async fn recv(&mut self) -> ServerFrame {
        match self.recv_timeout(RECV_TIMEOUT).await {
            Some(frame) => frame,
            None => panic!("no frame within {RECV_TIMEOUT:?}"),
        }
    }

    pub async fn recv_timeout(&mut self, within: Duration) -> Option<ServerFrame> {
        let deadline = Instant::now() + within;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => panic!("read error: {e}"),
                Ok(None) => panic!("connection ended"),
                Err(_) => return None,
            };
            match msg {
                Message::Text(text) => {
                    return Some(parse_server_frame(text.as_str()).expect("server frame"))
                }
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => continue,
            }
        }
    }

    /// Asserts nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Some(frame) = self.recv_timeout(QUIET_PERIOD).await {
            panic!("unexpected frame: {frame:?}");
        }
    }

    /// Reads until the server closes; returns the close code and every data
    /// frame seen before it.
    pub async fn recv_close(&mut self) -> (u16, Vec<ServerFrame>) {
        let mut frames = Vec::new();
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => panic!("read error before close: {e}"),
                Ok(None) => panic!("connection ended without a close frame"),
                Err(_) => panic!("no close within {RECV_TIMEOUT:?}"),
            };
            match msg {
                Message::Text(text) => frames.push(parse_server_frame(text.as_str()).unwrap()),
                Message::Close(Some(frame)) => return (u16::from(frame.code), frames),
                Message::Close(None) => return (1005, frames),
                _ => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
