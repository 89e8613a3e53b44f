//! Ingress for domain collaborators.
//!
//! Booking, chat and admin code call [`EventIntake::publish`] (or
//! [`EventIntake::publish_domain`] with one of the typed events in
//! [`events`]) and never touch sessions or subscriptions directly.

pub mod events;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use shopcast_core::{DomainError, Durability, Event, EventId, IdentityId, Topic};

use crate::router::{BroadcastRouter, RouteReport};

pub use events::{
    AlertSeverity, BookingStatusChanged, ChatMessagePosted, DomainEvent, Publication, SystemAlert,
};

/// Largest accepted payload, serialized.
pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Event has no topics")]
    NoTopics,

    #[error(transparent)]
    InvalidTopic(#[from] DomainError),

    #[error("Payload must be a JSON object")]
    PayloadNotObject,

    #[error("Payload is {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Delivery options for [`EventIntake::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub target: Option<IdentityId>,
    pub durability: Durability,
    /// Caller-supplied id for de-duplication; generated when absent.
    pub event_id: Option<EventId>,
}

impl PublishOptions {
    pub fn durable() -> Self {
        Self {
            durability: Durability::Durable,
            ..Self::default()
        }
    }

    pub fn target(mut self, identity: IdentityId) -> Self {
        self.target = Some(identity);
        self
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventIntake {
    router: BroadcastRouter,
}

impl EventIntake {
    pub fn new(router: BroadcastRouter) -> Self {
        Self { router }
    }

    /// Validates and routes an event.
    ///
    /// Topics are parsed and de-duplicated in order. The event is stamped
    /// with the current time.
    pub async fn publish(
        &self,
        topics: Vec<String>,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<RouteReport, IntakeError> {
        let event = build_event(topics, payload, options)?;
        debug!(
            event_id = %event.id,
            topics = event.topics.len(),
            durable = event.is_durable(),
            "Publishing event"
        );
        Ok(self.router.route(event).await)
    }

    pub async fn publish_domain(&self, event: impl DomainEvent) -> Result<RouteReport, IntakeError> {
        let Publication {
            topics,
            payload,
            options,
        } = event.into_publication();
        self.publish(topics, payload, options).await
    }
}

fn build_event(
    topics: Vec<String>,
    payload: serde_json::Value,
    options: PublishOptions,
) -> Result<Event, IntakeError> {
    let mut parsed: Vec<Topic> = Vec::with_capacity(topics.len());
    for raw in topics {
        let topic = Topic::parse(raw)?;
        if !parsed.contains(&topic) {
            parsed.push(topic);
        }
    }
    if parsed.is_empty() {
        return Err(IntakeError::NoTopics);
    }

    if !payload.is_object() {
        return Err(IntakeError::PayloadNotObject);
    }
    let size = payload.to_string().len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(IntakeError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_BYTES,
        });
    }

    Ok(Event {
        id: options.event_id.unwrap_or_else(EventId::generate),
        topics: parsed,
        payload,
        target: options.target,
        durability: options.durability,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::GatewayConfig;
    use crate::gateway::Gateway;
    use crate::sessions::SessionRegistry;
    use crate::store::{spawn_store, MemoryBackend, Retention};
    use crate::subscriptions::SubscriptionManager;
    use serde_json::json;
    use shopcast_core::Cursor;

    async fn create_intake() -> (EventIntake, Gateway) {
        let store = spawn_store(Arc::new(MemoryBackend), Retention::default())
            .await
            .unwrap();
        let gateway = Gateway::new(
            SessionRegistry::new(),
            SubscriptionManager::new(16),
            store,
            GatewayConfig::default(),
        );
        (EventIntake::new(BroadcastRouter::new(gateway.clone())), gateway)
    }

    #[test]
    fn test_build_event_dedupes_topics() {
        let event = build_event(
            vec!["booking:1".into(), "role:admin".into(), "booking:1".into()],
            json!({}),
            PublishOptions::default(),
        )
        .unwrap();
        assert_eq!(event.topics, vec![Topic::booking(1), Topic::parse("role:admin").unwrap()]);
        assert_eq!(event.durability, Durability::Ephemeral);
    }

    #[test]
    fn test_build_event_keeps_caller_event_id() {
        let event = build_event(
            vec!["chat:9".into()],
            json!({"text": "hi"}),
            PublishOptions::default().event_id(EventId::new("msg-1")),
        )
        .unwrap();
        assert_eq!(event.id, EventId::new("msg-1"));
    }

    #[test]
    fn test_build_event_rejections() {
        assert!(matches!(
            build_event(vec![], json!({}), PublishOptions::default()),
            Err(IntakeError::NoTopics)
        ));
        assert!(matches!(
            build_event(vec!["bad topic".into()], json!({}), PublishOptions::default()),
            Err(IntakeError::InvalidTopic(_))
        ));
        assert!(matches!(
            build_event(vec!["booking:1".into()], json!([1, 2]), PublishOptions::default()),
            Err(IntakeError::PayloadNotObject)
        ));

        let big = "x".repeat(MAX_PAYLOAD_BYTES);
        assert!(matches!(
            build_event(vec!["booking:1".into()], json!({ "blob": big }), PublishOptions::default()),
            Err(IntakeError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_durable_to_offline_target() {
        let (intake, gateway) = create_intake().await;
        let bob = IdentityId::new("bob").unwrap();

        for n in 0..3 {
            intake
                .publish(
                    vec!["booking:42".into()],
                    json!({ "step": n }),
                    PublishOptions::durable().target(bob.clone()),
                )
                .await
                .unwrap();
        }

        let page = gateway.store().list_since(&bob, Cursor::ZERO, 10).await.unwrap();
        let cursors: Vec<u64> = page.items.iter().map(|n| n.cursor.get()).collect();
        assert_eq!(cursors, vec![1, 2, 3]);
        assert_eq!(page.items[2].payload, json!({ "step": 2 }));
    }

    #[tokio::test]
    async fn test_publish_domain_event() {
        let (intake, gateway) = create_intake().await;
        let customer = IdentityId::new("cust-7").unwrap();

        let report = intake
            .publish_domain(BookingStatusChanged {
                booking_id: "42".to_string(),
                customer: customer.clone(),
                status: "repairing".to_string(),
                previous_status: Some("diagnosed".to_string()),
                technician: None,
                note: None,
            })
            .await
            .unwrap();
        assert_eq!(report.stored.len(), 1);

        let page = gateway.store().list_since(&customer, Cursor::ZERO, 10).await.unwrap();
        assert_eq!(page.items[0].topic, Topic::booking(42));
        assert_eq!(page.items[0].payload["status"], "repairing");
    }
}
