//! slotsync Configuration
//!
//! Connection, reconnect, heartbeat and reservation settings with serde
//! defaults, plus YAML loading and validation.

use crate::connection::ReconnectPolicy;
use crate::error::ConfigError;
use crate::model::ClientId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default availability service base URL
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";
/// Default WebSocket path for the availability feed
pub const DEFAULT_WS_PATH: &str = "/ws/availability";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_JITTER: f64 = 0.1;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 45_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_ACTIVITY_CAPACITY: usize = crate::presence::DEFAULT_ACTIVITY_CAPACITY;

const CONFIG_FILE: &str = "slotsync.yaml";

// ============================================================================
// Config Structures
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub reservation: ReservationConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    /// Stable client identity; a random one is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_url")]
    pub url: String,

    #[serde(default = "ServerConfig::default_path")]
    pub path: String,

    #[serde(default = "ServerConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ServerConfig {
    fn default_url() -> String {
        DEFAULT_SERVER_URL.to_string()
    }
    fn default_path() -> String {
        DEFAULT_WS_PATH.to_string()
    }
    fn default_connect_timeout_ms() -> u64 {
        DEFAULT_CONNECT_TIMEOUT_MS
    }

    /// Full WebSocket endpoint
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.path.is_empty() {
            return base.to_string();
        }
        format!("{}/{}", base, self.path.trim_start_matches('/'))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            path: Self::default_path(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "ReconnectConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "ReconnectConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "ReconnectConfig::default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "ReconnectConfig::default_jitter")]
    pub jitter: f64,
}

impl ReconnectConfig {
    fn default_base_delay_ms() -> u64 {
        DEFAULT_BASE_DELAY_MS
    }
    fn default_max_delay_ms() -> u64 {
        DEFAULT_MAX_DELAY_MS
    }
    fn default_max_attempts() -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }
    fn default_jitter() -> f64 {
        DEFAULT_JITTER
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            max_attempts: Self::default_max_attempts(),
            jitter: Self::default_jitter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Channel is declared dead after this long without inbound traffic
    #[serde(default = "HeartbeatConfig::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "HeartbeatConfig::default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl HeartbeatConfig {
    fn default_idle_timeout_ms() -> u64 {
        DEFAULT_IDLE_TIMEOUT_MS
    }
    fn default_ping_interval_ms() -> u64 {
        DEFAULT_PING_INTERVAL_MS
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: Self::default_idle_timeout_ms(),
            ping_interval_ms: Self::default_ping_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Pending claims with no server verdict expire after this long
    #[serde(default = "ReservationConfig::default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
}

impl ReservationConfig {
    fn default_claim_timeout_ms() -> u64 {
        DEFAULT_CLAIM_TIMEOUT_MS
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            claim_timeout_ms: Self::default_claim_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "PresenceConfig::default_activity_capacity")]
    pub activity_capacity: usize,
}

impl PresenceConfig {
    fn default_activity_capacity() -> usize {
        DEFAULT_ACTIVITY_CAPACITY
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            activity_capacity: Self::default_activity_capacity(),
        }
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader with validation
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<SyncConfig, ConfigError> {
        let config_path = Self::resolve_config_path(path)?;
        let content = std::fs::read_to_string(&config_path)?;
        let config: SyncConfig = serde_yml::from_str(&content)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Load if a config file exists, otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<SyncConfig, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) if path.is_none() => Ok(SyncConfig::default()),
            other => other,
        }
    }

    /// Resolve configuration file path
    fn resolve_config_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(ConfigError::NotFound(p.display().to_string()));
            }
            return Ok(p.to_path_buf());
        }

        Self::default_paths()
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                ConfigError::NotFound(format!(
                    "no {} in the config directory or working directory",
                    CONFIG_FILE
                ))
            })
    }

    pub fn default_paths() -> Vec<PathBuf> {
        vec![
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(CONFIG_FILE),
            PathBuf::from(".").join(CONFIG_FILE),
        ]
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration
    pub fn validate(config: &SyncConfig) -> Result<(), ConfigError> {
        let url = config.server.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::invalid(
                "server.url",
                format!("expected a ws:// or wss:// URL, got '{}'", url),
            ));
        }

        let reconnect = &config.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(ConfigError::invalid(
                "reconnect.base_delay_ms",
                "must be greater than zero",
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(ConfigError::invalid(
                "reconnect.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        if !(0.0..1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::invalid(
                "reconnect.jitter",
                format!("must be in [0.0, 1.0), got {}", reconnect.jitter),
            ));
        }

        if config.heartbeat.idle_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "heartbeat.idle_timeout_ms",
                "must be greater than zero",
            ));
        }
        if config.heartbeat.ping_interval_ms == 0
            || config.heartbeat.ping_interval_ms >= config.heartbeat.idle_timeout_ms
        {
            return Err(ConfigError::invalid(
                "heartbeat.ping_interval_ms",
                "must be non-zero and shorter than idle_timeout_ms",
            ));
        }

        if config.reservation.claim_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "reservation.claim_timeout_ms",
                "must be greater than zero",
            ));
        }

        if config
            .client_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConfigError::invalid("client_id", "cannot be blank"));
        }

        Ok(())
    }
}

impl SyncConfig {
    /// Configured identity, or a fresh random one
    pub fn client_id(&self) -> ClientId {
        self.client_id
            .as_deref()
            .map(ClientId::new)
            .unwrap_or_else(ClientId::generate)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_yml::to_string(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        SyncConfig {
            server: ServerConfig {
                url: "wss://booking.example.com".to_string(),
                ..ServerConfig::default()
            },
            client_id: Some("front-desk-1".to_string()),
            ..SyncConfig::default()
        }
    }
}
