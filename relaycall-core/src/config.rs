use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub relay: RelayConfig,
    pub negotiation: NegotiationConfig,
    pub reconnect: ReconnectConfig,
    pub registry: RegistryConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Realtime endpoint, e.g. `wss://relay.example.com/ws`
    pub url: String,
    pub heartbeat_interval_seconds: u64,
    /// Capacity of the outbound frame queue
    pub send_queue_capacity: usize,
    /// Capacity of the decoded inbound event queue
    pub event_queue_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8787/ws".to_string(),
            heartbeat_interval_seconds: 10,
            send_queue_capacity: 64,
            event_queue_capacity: 256,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the relay app, e.g. `https://rtc.example.com/v1/apps/<app-id>`
    pub base_url: String,
    /// Bearer token for the relay API
    pub app_token: String,
    pub request_timeout_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787/v1/apps/local".to_string(),
            app_token: String::new(),
            request_timeout_seconds: 15,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Upper bound for each offer/answer/description call on the engine
    pub engine_timeout_seconds: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            engine_timeout_seconds: 10,
        }
    }
}

impl NegotiationConfig {
    #[must_use]
    pub const fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts after the first failure (0 = give up immediately)
    pub max_attempts: usize,
    /// Overall bound on one reconnection, after which the call ends
    pub window_seconds: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 8_000,
            max_attempts: 8,
            window_seconds: 30,
        }
    }
}

/// What happens to participants that an update no longer mentions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipPolicy {
    /// Keep them until explicitly removed
    #[default]
    Retain,
    /// Remove them and cancel their pulls
    Prune,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub membership: MembershipPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ice_servers: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Credentials served by [`crate::credentials::StaticCredentialStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub api_key: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RELAYCALL_SIGNALING__URL, RELAYCALL_RELAY__APP_TOKEN, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.signaling.url.is_empty() {
            errors.push("signaling.url must not be empty".to_string());
        }
        if self.signaling.heartbeat_interval_seconds == 0 {
            errors.push("signaling.heartbeat_interval_seconds must be > 0".to_string());
        }
        if self.signaling.send_queue_capacity == 0 || self.signaling.event_queue_capacity == 0 {
            errors.push("signaling queue capacities must be > 0".to_string());
        }
        if self.relay.base_url.is_empty() {
            errors.push("relay.base_url must not be empty".to_string());
        }
        if self.relay.request_timeout_seconds == 0 {
            errors.push("relay.request_timeout_seconds must be > 0".to_string());
        }
        if self.negotiation.engine_timeout_seconds == 0 {
            errors.push("negotiation.engine_timeout_seconds must be > 0".to_string());
        }
        if self.reconnect.min_delay_ms > self.reconnect.max_delay_ms {
            errors.push(format!(
                "reconnect.min_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.min_delay_ms, self.reconnect.max_delay_ms
            ));
        }
        if self.reconnect.window_seconds == 0 {
            errors.push("reconnect.window_seconds must be > 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
