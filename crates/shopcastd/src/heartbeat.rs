//! Liveness probing.
//!
//! Every interval each deliverable connection gets a WebSocket ping. A
//! connection that shows no inbound activity for a full interval after its
//! probe is closed with `HeartbeatTimeout`, which cascades through the
//! session registry and subscription manager like any other close.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shopcast_protocol::CloseReason;

use crate::gateway::{Delivery, Gateway, Outbound};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub reaped: usize,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    gateway: Gateway,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(gateway: Gateway, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probes idle connections and reaps those whose probe went unanswered.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for handle in self.gateway.connections() {
            if !handle.state().accepts_delivery() {
                continue;
            }

            match handle.pending_probe() {
                Some(sent) if now.saturating_duration_since(sent) >= self.interval => {
                    warn!(
                        conn = %handle.id(),
                        identity = %handle.identity(),
                        "Heartbeat timeout, closing connection"
                    );
                    if self.gateway.close(handle.id(), CloseReason::HeartbeatTimeout) {
                        report.reaped += 1;
                    }
                }
                // Still waiting on the previous probe
                Some(_) => {}
                None => {
                    if self.gateway.send(handle.id(), Outbound::Probe) != Delivery::Dropped {
                        handle.record_probe(now);
                        report.probed += 1;
                    }
                }
            }
        }
        report
    }

    /// Runs [`sweep`](Self::sweep) every interval until cancelled.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + self.interval, self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = self.interval.as_secs(), "Heartbeat monitor started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        info!("Heartbeat monitor shutting down");
                        break;
                    }

                    _ = tick.tick() => {
                        let report = self.sweep();
                        if report.reaped > 0 || report.probed > 0 {
                            debug!(probed = report.probed, reaped = report.reaped, "Heartbeat sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::GatewayConfig;
    use crate::sessions::SessionRegistry;
    use crate::store::{spawn_store, MemoryBackend, Retention};
    use crate::subscriptions::SubscriptionManager;
    use shopcast_core::{ConnectionState, Identity, IdentityId, Role, Topic};
    use shopcast_protocol::ProtocolVersion;
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_secs(30);

    async fn create_monitor() -> (HeartbeatMonitor, Gateway) {
        let store = spawn_store(Arc::new(MemoryBackend), Retention::default())
            .await
            .unwrap();
        let gateway = Gateway::new(
            SessionRegistry::new(),
            SubscriptionManager::new(16),
            store,
            GatewayConfig::default(),
        );
        (HeartbeatMonitor::new(gateway.clone(), INTERVAL), gateway)
    }

    fn alice() -> Identity {
        Identity::new(IdentityId::new("alice").unwrap(), Role::Customer)
    }

    fn count_probes(rx: &mut mpsc::Receiver<Outbound>) -> usize {
        let mut probes = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, Outbound::Probe) {
                probes += 1;
            }
        }
        probes
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sweep_probes() {
        let (monitor, gateway) = create_monitor().await;
        let (handle, mut rx) = gateway.open(alice(), ProtocolVersion::CURRENT);

        let report = monitor.sweep();
        assert_eq!(report, SweepReport { probed: 1, reaped: 0 });
        assert_eq!(count_probes(&mut rx), 1);
        assert!(handle.pending_probe().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_probe_is_not_repeated() {
        let (monitor, gateway) = create_monitor().await;
        let (_handle, mut rx) = gateway.open(alice(), ProtocolVersion::CURRENT);

        monitor.sweep();
        tokio::time::advance(INTERVAL / 2).await;
        assert_eq!(monitor.sweep(), SweepReport::default());
        assert_eq!(count_probes(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_reaps_connection() {
        let (monitor, gateway) = create_monitor().await;
        let (handle, _rx) = gateway.open(alice(), ProtocolVersion::CURRENT);
        gateway
            .subscriptions()
            .subscribe(handle.id(), &Topic::booking(42))
            .unwrap();

        monitor.sweep();
        tokio::time::advance(INTERVAL).await;
        let report = monitor.sweep();

        assert_eq!(report.reaped, 1);
        assert_eq!(handle.state(), ConnectionState::Closing);
        assert_eq!(handle.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(gateway.subscriptions().connections_for(&Topic::booking(42)).is_empty());
        assert!(!gateway.sessions().is_online(&alice().id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_clears_probe() {
        let (monitor, gateway) = create_monitor().await;
        let (handle, mut rx) = gateway.open(alice(), ProtocolVersion::CURRENT);

        monitor.sweep();
        tokio::time::advance(INTERVAL / 2).await;
        handle.record_activity();
        tokio::time::advance(INTERVAL / 2).await;

        let report = monitor.sweep();
        assert_eq!(report, SweepReport { probed: 1, reaped: 0 });
        assert_eq!(count_probes(&mut rx), 2);
        assert!(!handle.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_reaps_within_two_intervals() {
        let (monitor, gateway) = create_monitor().await;
        let (handle, _rx) = gateway.open(alice(), ProtocolVersion::CURRENT);
        let cancel = CancellationToken::new();
        let task = monitor.spawn(cancel.clone());

        // Probe at one interval, reap at two
        tokio::time::sleep(INTERVAL * 2 + Duration::from_millis(10)).await;
        assert_eq!(handle.close_reason(), Some(CloseReason::HeartbeatTimeout));

        cancel.cancel();
        task.await.unwrap();
    }
}
