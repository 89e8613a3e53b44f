//! shopcast daemon - real-time status and notification delivery
//!
//! - `gateway` - WebSocket server, connection lifecycle and outbound queues
//! - `sessions` - identity to connections index (multi-device fan-out)
//! - `subscriptions` - per-connection topic sets and the topic reverse index
//! - `router` - event fan-out to live connections and the notification store
//! - `store` - per-identity notification log with cursors and read state
//! - `heartbeat` - liveness probing and reaping
//! - `intake` - the `publish` entry point for domain collaborators
//! - `monitor` - process resource and load logging
//!
//! # Architecture
//!
//! ```text
//! collaborator ──▶ EventIntake ──▶ BroadcastRouter ──┬──▶ StoreActor (per-identity log)
//!                                                   │
//!                                                   ▼
//!               SubscriptionManager + SessionRegistry (resolve)
//!                                                   │
//!                                                   ▼
//!                 Gateway::send ──▶ per-connection queue ──▶ socket task ──▶ client
//!
//! client ──▶ socket task ──▶ Gateway::dispatch ──┬──▶ SubscriptionManager
//!                                               └──▶ StoreActor (ack / catch-up)
//! ```
//!
//! No production code path panics: fallible operations return `Result`, and
//! closed channels surface as errors.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod heartbeat;
pub mod intake;
pub mod monitor;
pub mod router;
pub mod service;
pub mod sessions;
pub mod store;
pub mod subscriptions;

pub use service::{Service, ServiceError};
