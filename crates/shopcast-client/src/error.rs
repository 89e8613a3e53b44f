//! Error types for the shopcast client.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not open the WebSocket.
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The server refused the handshake. Retrying with the same token will
    /// not help.
    #[error("Handshake rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    /// The server closed the connection with a code that forbids reconnecting.
    #[error("Connection closed by server ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Failed to parse frame: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Client cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether the reconnect loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Rejected { .. } | Self::Closed { .. } | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
