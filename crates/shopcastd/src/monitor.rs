//! Periodic resource and load logging.
//!
//! Samples the daemon's memory and CPU with `sysinfo` and logs them next to
//! the live connection, session and stored-notification counts. Warns when
//! a resource threshold is crossed.

use std::process;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::store::StoreStats;

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 256;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// How often to sample.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Process resource snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetrics {
    pub memory_bytes: u64,
    pub memory_mb: u64,
    /// 0.0 - 100.0+ (one full core is 100)
    pub cpu_percent: f32,
    pub memory_high: bool,
    pub cpu_high: bool,
}

impl ProcessMetrics {
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Delivery-layer load snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadMetrics {
    pub connections: usize,
    pub identities_online: usize,
    pub topics: usize,
    pub store: StoreStats,
}

impl LoadMetrics {
    pub async fn sample(gateway: &Gateway) -> Self {
        Self {
            connections: gateway.connection_count(),
            identities_online: gateway.sessions().identity_count(),
            topics: gateway.subscriptions().topic_count(),
            store: gateway.store().stats().await,
        }
    }
}

pub struct ProcessMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes process information and returns current metrics.
    ///
    /// CPU usage is measured against the previous refresh, so the first
    /// sample reads zero.
    pub fn refresh(&mut self) -> ProcessMetrics {
        // A single-process refresh does not compute CPU usage
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let memory_mb = memory_bytes / 1024 / 1024;
        ProcessMetrics {
            memory_bytes,
            memory_mb,
            cpu_percent,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        }
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the metrics task. Stops when `cancel_token` fires.
pub fn spawn_monitor_task(gateway: Gateway, cancel_token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ProcessMonitor::new();
        let mut tick = interval(METRICS_INTERVAL);

        // Baseline for CPU
        let _ = monitor.refresh();

        info!(
            memory_threshold_mb = monitor.memory_threshold_mb(),
            cpu_threshold_percent = monitor.cpu_threshold_percent(),
            interval_secs = METRICS_INTERVAL.as_secs(),
            "Process monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Process monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let metrics = monitor.refresh();
                    let load = LoadMetrics::sample(&gateway).await;
                    log_metrics(&metrics, &load, &monitor);
                }
            }
        }

        debug!("Process monitor task completed");
    })
}

fn log_metrics(metrics: &ProcessMetrics, load: &LoadMetrics, monitor: &ProcessMonitor) {
    let cpu_percent = format!("{:.1}", metrics.cpu_percent);
    if metrics.memory_high {
        warn!(
            memory_mb = metrics.memory_mb,
            threshold_mb = monitor.memory_threshold_mb(),
            cpu_percent = %cpu_percent,
            connections = load.connections,
            "HIGH MEMORY: daemon memory usage above threshold"
        );
    } else if metrics.cpu_high {
        warn!(
            memory_mb = metrics.memory_mb,
            cpu_percent = %cpu_percent,
            threshold_percent = monitor.cpu_threshold_percent(),
            connections = load.connections,
            "HIGH CPU: daemon CPU usage above threshold"
        );
    } else {
        info!(
            memory_mb = metrics.memory_mb,
            cpu_percent = %cpu_percent,
            connections = load.connections,
            identities_online = load.identities_online,
            topics = load.topics,
            stored = load.store.notifications,
            unread = load.store.unread,
            "Daemon status"
        );
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
    use shopcast_core::{Identity, IdentityId, Role};
    use shopcast_protocol::ProtocolVersion;

    #[test]
    fn test_process_metrics_flags() {
        assert!(!ProcessMetrics::default().is_any_high());
        let metrics = ProcessMetrics {
            memory_bytes: 300 * 1024 * 1024,
            memory_mb: 300,
            cpu_percent: 10.0,
            memory_high: true,
            cpu_high: false,
        };
        assert!(metrics.is_any_high());
    }

    #[test]
    fn test_monitor_custom_thresholds() {
        let monitor = ProcessMonitor::with_thresholds(50, 50.0);
        assert_eq!(monitor.memory_threshold_mb(), 50);
        assert_eq!(monitor.cpu_threshold_percent(), 50.0);
    }

    #[test]
    fn test_monitor_refresh_reads_own_process() {
        let mut monitor = ProcessMonitor::new();
        let metrics = monitor.refresh();
        assert!(metrics.memory_bytes > 0);
        assert!(metrics.cpu_percent >= 0.0);
    }

    #[tokio::test]
    async fn test_load_metrics_sample() {
        let store = spawn_store(Arc::new(MemoryBackend), Retention::default())
            .await
            .unwrap();
        let gateway = Gateway::new(
            SessionRegistry::new(),
            SubscriptionManager::new(16),
            store,
            GatewayConfig::default(),
        );
        let alice = Identity::new(IdentityId::new("alice").unwrap(), Role::Customer);
        let (_a, _ra) = gateway.open(alice.clone(), ProtocolVersion::CURRENT);
        let (_b, _rb) = gateway.open(alice, ProtocolVersion::CURRENT);

        let load = LoadMetrics::sample(&gateway).await;
        assert_eq!(load.connections, 2);
        assert_eq!(load.identities_online, 1);
        // user:alice and role:customer
        assert_eq!(load.topics, 2);
        assert_eq!(load.store, StoreStats::default());
    }
}
