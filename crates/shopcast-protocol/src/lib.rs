//! Shopcast Protocol - Wire protocol for notification delivery
//!
//! This crate provides the JSON envelope exchanged over WebSocket text
//! frames between clients and the shopcast daemon, plus the error and
//! close codes both sides agree on.

pub mod codes;
pub mod frame;
pub mod parse;
pub mod version;

pub use codes::{CloseReason, ErrorCode};
pub use frame::{ClientFrame, ServerFrame};
pub use parse::{parse_client_frame, parse_server_frame, FrameError, MAX_FRAME_SIZE};
pub use version::{ProtocolVersion, VersionError};
