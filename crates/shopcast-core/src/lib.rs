//! Shopcast Core - Shared types for real-time notification delivery
//!
//! This crate provides the core domain types shared between
//! the daemon (shopcastd), the wire protocol and the client library.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod error;
pub mod event;
pub mod identity;
pub mod notification;
pub mod topic;

// Re-exports for convenience
pub use connection::{ConnectionId, ConnectionState};
pub use error::{DomainError, DomainResult};
pub use event::{Durability, Event, EventId};
pub use identity::{Identity, IdentityId, Role, MAX_IDENTITY_LEN};
pub use notification::{Cursor, Notification};
pub use topic::{Topic, TopicKind, MAX_TOPIC_LEN};
