//! Parsing inbound and outbound frames.
//!
//! Malformed input and unknown frame types are distinguished so the
//! daemon can answer with the right error code.

use thiserror::Error;

use crate::codes::ErrorCode;
use crate::frame::{ClientFrame, ServerFrame};

/// Maximum accepted text frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Missing 'type' field")]
    MissingType,

    #[error("Unknown frame type: '{0}'")]
    UnknownType(String),
}

impl FrameError {
    /// Error code reported back to the sender.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownType(_) => ErrorCode::UnknownType,
            Self::TooLarge { .. } | Self::Malformed(_) | Self::MissingType => {
                ErrorCode::MalformedFrame
            }
        }
    }
}

/// Decodes a client frame from WebSocket text.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let frame_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(FrameError::MissingType)?;

    if !ClientFrame::TYPES.contains(&frame_type) {
        return Err(FrameError::UnknownType(frame_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Decodes a server frame; used by clients.
pub fn parse_server_frame(text: &str) -> Result<ServerFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))
}
