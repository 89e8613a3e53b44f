//! Daemon configuration.
//!
//! Loaded from a TOML file with every section optional:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9470"
//!
//! [heartbeat]
//! interval_secs = 30
//!
//! [store]
//! backend = "jsonl"
//! data_dir = "/var/lib/shopcast"
//!
//! [[auth.tokens]]
//! token = "dev-admin"
//! identity = "admin-1"
//! role = "admin"
//! ```
//!
//! `SHOPCAST_LISTEN` overrides `server.listen` and `SHOPCAST_JWT_SECRET`
//! overrides `auth.jwt_secret`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shopcast_core::Role;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SHOPCAST_CONFIG";
/// Environment override for the listen address.
pub const LISTEN_ENV: &str = "SHOPCAST_LISTEN";
/// Environment override for the JWT secret.
pub const JWT_SECRET_ENV: &str = "SHOPCAST_JWT_SECRET";

/// Default WebSocket listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:9470";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub heartbeat: HeartbeatConfig,
    pub subscriptions: SubscriptionConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

/// Per-connection limits enforced by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Time allowed for upgrade plus authentication.
    pub handshake_timeout_ms: u64,
    /// Hard cap of the outbound queue; a full queue closes the connection.
    pub outbound_capacity: usize,
    /// Queue depth at which a connection becomes backpressured.
    pub high_water_mark: usize,
    /// Queue depth at which a backpressured connection recovers.
    pub low_water_mark: usize,
    /// How long a connection may stay backpressured before it is closed.
    pub backpressure_grace_ms: u64,
    pub malformed_frame_limit: usize,
    pub malformed_frame_window_ms: u64,
    /// Page size of a catch-up when the client names none.
    pub catch_up_limit: usize,
    pub max_catch_up_limit: usize,
    /// Budget for flushing queued frames while closing.
    pub flush_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            outbound_capacity: 1_024,
            high_water_mark: 256,
            low_water_mark: 64,
            backpressure_grace_ms: 10_000,
            malformed_frame_limit: 10,
            malformed_frame_window_ms: 60_000,
            catch_up_limit: 100,
            max_catch_up_limit: 500,
            flush_timeout_ms: 1_000,
        }
    }
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn backpressure_grace(&self) -> Duration {
        Duration::from_millis(self.backpressure_grace_ms)
    }

    pub fn malformed_frame_window(&self) -> Duration {
        Duration::from_millis(self.malformed_frame_window_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub max_per_connection: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_per_connection: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Lost on restart.
    #[default]
    Memory,
    /// One append-only journal per identity under `data_dir`.
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    pub data_dir: Option<PathBuf>,
    /// Notifications kept per identity; older ones are pruned.
    pub max_per_identity: usize,
    /// Notifications older than this are pruned.
    pub max_age_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            data_dir: None,
            max_per_identity: 500,
            max_age_secs: 30 * 24 * 60 * 60,
            prune_interval_secs: 300,
        }
    }
}

impl StoreConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// A fixed bearer token, for development and service-to-service clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub identity: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for JWT bearer tokens.
    pub jwt_secret: Option<String>,
    pub tokens: Vec<StaticToken>,
}

// ============================================================================
// Loading
// ============================================================================

impl ServiceConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config from `path`, or from `SHOPCAST_CONFIG`, or defaults,
    /// then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => ServiceConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            if !listen.trim().is_empty() {
                self.server.listen = listen;
            }
        }
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth.jwt_secret = Some(secret);
            }
        }
    }

    /// Rejects combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gw = &self.gateway;
        if gw.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "gateway.outbound_capacity must be positive".to_string(),
            ));
        }
        if gw.low_water_mark >= gw.high_water_mark || gw.high_water_mark > gw.outbound_capacity {
            return Err(ConfigError::Invalid(format!(
                "gateway water marks must satisfy low < high <= capacity (got {} / {} / {})",
                gw.low_water_mark, gw.high_water_mark, gw.outbound_capacity
            )));
        }
        if gw.catch_up_limit == 0 || gw.catch_up_limit > gw.max_catch_up_limit {
            return Err(ConfigError::Invalid(
                "gateway.catch_up_limit must be in 1..=max_catch_up_limit".to_string(),
            ));
        }
        if gw.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "gateway.handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be positive".to_string(),
            ));
        }
        if self.subscriptions.max_per_connection == 0 {
            return Err(ConfigError::Invalid(
                "subscriptions.max_per_connection must be positive".to_string(),
            ));
        }
        if self.store.max_per_identity == 0 {
            return Err(ConfigError::Invalid(
                "store.max_per_identity must be positive".to_string(),
            ));
        }
        if self.store.prune_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "store.prune_interval_secs must be positive".to_string(),
            ));
        }
        // Zero would expire every notification on the first prune
        if self.store.max_age_secs == 0 {
            return Err(ConfigError::Invalid(
                "store.max_age_secs must be positive".to_string(),
            ));
        }
        if self.store.backend == StoreBackendKind::Jsonl && self.store.data_dir.is_none() {
            return Err(ConfigError::Invalid(
                "store.data_dir is required for the jsonl backend".to_string(),
            ));
        }
        if self.auth.jwt_secret.is_none() && self.auth.tokens.is_empty() {
            return Err(ConfigError::Invalid(
                "auth needs a jwt_secret or at least one static token".to_string(),
            ));
        }
        Ok(())
    }
}
