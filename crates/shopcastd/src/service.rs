//! Assembles and runs every component of the delivery layer.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthVerifier;
use crate::config::{ConfigError, ServiceConfig};
use crate::gateway::{Gateway, GatewayServer, ServerError};
use crate::heartbeat::HeartbeatMonitor;
use crate::intake::EventIntake;
use crate::monitor::spawn_monitor_task;
use crate::router::BroadcastRouter;
use crate::sessions::SessionRegistry;
use crate::store::{open_backend, spawn_store, Retention, StoreError};
use crate::subscriptions::SubscriptionManager;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Notification store failed to start: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Service task failed: {0}")]
    Task(#[from] JoinError),
}

/// A running service. Dropping it does not stop anything; call
/// [`shutdown`](Self::shutdown) then [`join`](Self::join).
pub struct Service {
    local_addr: SocketAddr,
    gateway: Gateway,
    intake: EventIntake,
    cancel_token: CancellationToken,
    server: JoinHandle<Result<(), ServerError>>,
    background: Vec<JoinHandle<()>>,
}

impl Service {
    /// Opens the store, binds the listener and spawns the server, heartbeat
    /// and monitor tasks. Everything stops when `cancel_token` fires.
    pub async fn start(
        config: &ServiceConfig,
        auth: Arc<dyn AuthVerifier>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let backend = open_backend(&config.store).await?;
        info!(backend = backend.name(), "Notification store backend ready");
        let store = spawn_store(backend, Retention::from(&config.store)).await?;

        let gateway = Gateway::new(
            SessionRegistry::new(),
            SubscriptionManager::new(config.subscriptions.max_per_connection),
            store,
            config.gateway.clone(),
        );
        let intake = EventIntake::new(BroadcastRouter::new(gateway.clone()));

        let server = GatewayServer::bind(
            &config.server.listen,
            gateway.clone(),
            auth,
            cancel_token.clone(),
        )
        .await?;
        let local_addr = server.local_addr()?;

        let heartbeat = HeartbeatMonitor::new(gateway.clone(), config.heartbeat.interval());
        let background = vec![
            heartbeat.spawn(cancel_token.clone()),
            spawn_monitor_task(gateway.clone(), cancel_token.clone()),
        ];
        let server = tokio::spawn(server.run());

        info!(addr = %local_addr, "Service started");
        Ok(Self {
            local_addr,
            gateway,
            intake,
            cancel_token,
            server,
            background,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Entry point for domain collaborators.
    pub fn intake(&self) -> &EventIntake {
        &self.intake
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Signals every task to stop.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Waits for the server and background tasks to finish.
    pub async fn join(self) -> Result<(), ServiceError> {
        let result = self.server.await;
        for task in self.background {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        result??;
        info!("Service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::config::StoreBackendKind;

    fn test_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.server.listen = "127.0.0.1:0".to_string();
        config.auth.jwt_secret = Some("secret".to_string());
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let cancel = CancellationToken::new();
        let service = Service::start(
            &test_config(),
            Arc::new(StaticTokenVerifier::new()),
            cancel.clone(),
        )
        .await
        .unwrap();
        assert_ne!(service.local_addr().port(), 0);

        service.shutdown();
        assert!(cancel.is_cancelled());
        service.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.store.backend = StoreBackendKind::Jsonl;
        config.store.data_dir = None;

        let result = Service::start(
            &config,
            Arc::new(StaticTokenVerifier::new()),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first = Service::start(
            &test_config(),
            Arc::new(StaticTokenVerifier::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut config = test_config();
        config.server.listen = first.local_addr().to_string();
        let result = Service::start(
            &config,
            Arc::new(StaticTokenVerifier::new()),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ServiceError::Server(ServerError::Bind { .. }))));

        first.shutdown();
        first.join().await.unwrap();
    }
}
