//! shopcast client - subscribe to a shopcast daemon over WebSocket
//!
//! The client authenticates, restores subscriptions after reconnects and
//! resumes from the last cursor it saw, so an application only consumes
//! [`ClientEvent`]s and sends [`ClientCommand`]s.

pub mod client;
pub mod error;

pub use client::{next_delay, ClientCommand, ClientConfig, ClientEvent, NotificationClient};
pub use error::{ClientError, Result};
