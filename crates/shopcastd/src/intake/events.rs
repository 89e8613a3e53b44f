//! Typed domain events raised by collaborators.

use serde::{Deserialize, Serialize};
use serde_json::json;

use shopcast_core::{IdentityId, Role, Topic};

use super::PublishOptions;

/// Arguments for one `publish` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topics: Vec<String>,
    pub payload: serde_json::Value,
    pub options: PublishOptions,
}

/// A domain event that knows its topics, recipient and durability.
pub trait DomainEvent {
    fn into_publication(self) -> Publication;
}

/// A booking moved through the repair workflow.
///
/// Goes to the booking's watchers and the admin queue, and is kept for the
/// customer until read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingStatusChanged {
    pub booking_id: String,
    pub customer: IdentityId,
    pub status: String,
    pub previous_status: Option<String>,
    pub technician: Option<IdentityId>,
    pub note: Option<String>,
}

impl DomainEvent for BookingStatusChanged {
    fn into_publication(self) -> Publication {
        let topics = vec![
            Topic::booking(&self.booking_id).to_string(),
            Topic::role(Role::Admin).to_string(),
        ];
        let options = PublishOptions::durable().target(self.customer.clone());
        Publication {
            topics,
            payload: json!({
                "kind": "booking_status_changed",
                "booking_id": self.booking_id,
                "status": self.status,
                "previous_status": self.previous_status,
                "technician": self.technician,
                "note": self.note,
            }),
            options,
        }
    }
}

/// A chat message was posted to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePosted {
    pub conversation_id: String,
    pub sender: IdentityId,
    pub recipient: IdentityId,
    pub message_id: String,
    /// Truncated message text.
    pub preview: String,
}

impl DomainEvent for ChatMessagePosted {
    fn into_publication(self) -> Publication {
        let options = PublishOptions::durable().target(self.recipient.clone());
        Publication {
            topics: vec![Topic::chat(&self.conversation_id).to_string()],
            payload: json!({
                "kind": "chat_message_posted",
                "conversation_id": self.conversation_id,
                "message_id": self.message_id,
                "sender": self.sender,
                "preview": self.preview,
            }),
            options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Operational alert for admins. Only critical alerts are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
}

impl DomainEvent for SystemAlert {
    fn into_publication(self) -> Publication {
        let options = match self.severity {
            AlertSeverity::Critical => PublishOptions::durable(),
            AlertSeverity::Info | AlertSeverity::Warning => PublishOptions::default(),
        };
        Publication {
            topics: vec![Topic::role(Role::Admin).to_string()],
            payload: json!({
                "kind": "system_alert",
                "severity": self.severity,
                "title": self.title,
                "message": self.message,
            }),
            options,
        }
    }
}
