//! Event fan-out.
//!
//! Routing an event resolves its recipient connections, queues one frame
//! per connection and, for durable events, stores one notification per
//! recipient identity. Live delivery happens first so a slow store never
//! delays a connected client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, error, warn};

use shopcast_core::{ConnectionId, Cursor, Event, EventId, IdentityId, Topic};
use shopcast_protocol::ServerFrame;

use crate::gateway::{Delivery, Gateway, Outbound};
use crate::store::NewNotification;

/// What happened to one routed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub event_id: EventId,
    /// Connections the frame was queued to.
    pub delivered: usize,
    /// Resolved connections that could not take the frame.
    pub dropped: usize,
    /// Notifications stored, one per identity.
    pub stored: Vec<(IdentityId, Cursor)>,
    /// Identities whose notification could not be stored.
    pub durability_misses: Vec<IdentityId>,
}

impl RouteReport {
    fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            delivered: 0,
            dropped: 0,
            stored: Vec::new(),
            durability_misses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    gateway: Gateway,
}

impl BroadcastRouter {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Connections that should receive `event`, each with the first topic
    /// it matched on.
    ///
    /// Every subscriber of any event topic matches. A targeted event also
    /// reaches the target's connections subscribed to its personal topic.
    pub fn resolve(&self, event: &Event) -> BTreeMap<ConnectionId, Topic> {
        let subscriptions = self.gateway.subscriptions();
        let mut matched = BTreeMap::new();

        for topic in &event.topics {
            for conn in subscriptions.connections_for(topic) {
                matched.entry(conn).or_insert_with(|| topic.clone());
            }
        }

        if let Some(target) = &event.target {
            let personal = Topic::user(target);
            for conn in self.gateway.sessions().connections_for(target) {
                if subscriptions.is_subscribed(conn, &personal) {
                    matched.entry(conn).or_insert_with(|| personal.clone());
                }
            }
        }
        matched
    }

    /// Delivers `event` to every resolved connection and stores it for every
    /// recipient identity when durable. Never fails; problems are counted in
    /// the report.
    pub async fn route(&self, event: Event) -> RouteReport {
        let mut report = RouteReport::new(event.id.clone());
        let matched = self.resolve(&event);

        // Serialized once per topic, shared by every connection.
        let mut frames: HashMap<Topic, Arc<str>> = HashMap::new();
        // First matched topic per identity, in connection order.
        let mut recipients: BTreeMap<IdentityId, Topic> = BTreeMap::new();

        for (conn, topic) in matched {
            let Some(handle) = self.gateway.connection(conn) else {
                report.dropped += 1;
                continue;
            };
            recipients
                .entry(handle.identity().id.clone())
                .or_insert_with(|| topic.clone());

            if !handle.state().accepts_delivery() {
                report.dropped += 1;
                continue;
            }

            let frame = match frames.get(&topic) {
                Some(frame) => Arc::clone(frame),
                None => match event_frame(&event, &topic) {
                    Some(frame) => {
                        frames.insert(topic.clone(), Arc::clone(&frame));
                        frame
                    }
                    None => {
                        report.dropped += 1;
                        continue;
                    }
                },
            };

            match self.gateway.send(conn, Outbound::Text(frame)) {
                Delivery::Queued | Delivery::Backpressured => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
            }
        }

        if event.is_durable() {
            if let Some(target) = &event.target {
                let topic = event
                    .primary_topic()
                    .cloned()
                    .unwrap_or_else(|| Topic::user(target));
                recipients.entry(target.clone()).or_insert(topic);
            }
            self.store(&event, recipients, &mut report).await;
        }

        debug!(
            event_id = %report.event_id,
            delivered = report.delivered,
            dropped = report.dropped,
            stored = report.stored.len(),
            "Event routed"
        );
        report
    }

    async fn store(
        &self,
        event: &Event,
        recipients: BTreeMap<IdentityId, Topic>,
        report: &mut RouteReport,
    ) {
        let store = self.gateway.store();
        for (identity, topic) in recipients {
            let record = NewNotification {
                identity: identity.clone(),
                topic,
                event_id: event.id.clone(),
                payload: event.payload.clone(),
                created_at: event.timestamp,
            };
            match store.append(record).await {
                Ok(notification) => report.stored.push((identity, notification.cursor)),
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        identity = %identity,
                        error = %e,
                        "Durability miss: notification not stored"
                    );
                    report.durability_misses.push(identity);
                }
            }
        }
    }
}

fn event_frame(event: &Event, topic: &Topic) -> Option<Arc<str>> {
    let frame = ServerFrame::Event {
        event_id: event.id.clone(),
        topic: topic.to_string(),
        payload: event.payload.clone(),
        sent_at: event.timestamp,
    };
    match frame.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Failed to serialize event frame");
            None
        }
    }
}
