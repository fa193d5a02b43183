//! Broker configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STOMPD_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stompd_core::{DestinationKind, ExchangeConfig, RouterConfig};
use stompd_protocol::HeartBeatPolicy;

/// Broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Routing and scheduling configuration.
    pub broker: BrokerConfig,
    /// Heart-beat negotiation limits.
    pub heartbeat: HeartBeatConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STOMPD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.broker.apply_env_overrides();
        self.heartbeat.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Rejects settings the broker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "broker.tick_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.broker.max_work == 0 || self.broker.dispatch_limit == 0 {
            return Err(ConfigError::ValidationError(
                "broker.max_work and broker.dispatch_limit must be non-zero".to_string(),
            ));
        }
        if self.heartbeat.timeout_factor == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat.timeout_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often buffered output is written to sockets, in milliseconds.
    pub flush_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], stompd_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            flush_interval_ms: 5,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("STOMPD_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("STOMPD_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(ms) = std::env::var("STOMPD_FLUSH_INTERVAL_MS") {
            if let Ok(n) = ms.parse() {
                self.flush_interval_ms = n;
            }
        }
    }

    /// Returns the flush interval as Duration (never zero).
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Routing and scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Scheduler pass interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Frames processed per peer per pass.
    pub max_work: usize,
    /// Messages routed per exchange per pass.
    pub dispatch_limit: usize,
    /// Messages written per subscription per pass.
    pub delivery_batch: usize,
    /// Inactivity timeout for queue messages in seconds (0 = never).
    pub queue_message_expire_secs: u64,
    /// Byte limit for queue exchanges.
    pub queue_byte_limit: usize,
    /// Byte limit for topic exchanges.
    pub topic_byte_limit: usize,
    /// Minimum seconds between expiry runs.
    pub expire_interval_secs: u64,
    /// Maximum messages inspected per expiry run.
    pub expire_limit: usize,
    /// Pause in milliseconds after a fanout pass that deferred messages.
    pub deferred_interval_ms: u64,
    /// Minimum seconds between dead-message recovery runs.
    pub recover_dead_interval_secs: u64,
    /// Seconds between exchange statistics lines.
    pub stats_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1,
            max_work: 100,
            dispatch_limit: 100,
            delivery_batch: 1000,
            queue_message_expire_secs: 3600,
            queue_byte_limit: 3_145_728,
            topic_byte_limit: 3_145_728,
            expire_interval_secs: 5,
            expire_limit: 20_000,
            deferred_interval_ms: 10,
            recover_dead_interval_secs: 30,
            stats_interval_secs: 10,
        }
    }
}

impl BrokerConfig {
    fn apply_env_overrides(&mut self) {
        env_override("STOMPD_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        env_override("STOMPD_MAX_WORK", &mut self.max_work);
        env_override("STOMPD_DISPATCH_LIMIT", &mut self.dispatch_limit);
        env_override("STOMPD_DELIVERY_BATCH", &mut self.delivery_batch);
        env_override("STOMPD_QUEUE_MESSAGE_EXPIRE_SECS", &mut self.queue_message_expire_secs);
        env_override("STOMPD_QUEUE_BYTE_LIMIT", &mut self.queue_byte_limit);
        env_override("STOMPD_TOPIC_BYTE_LIMIT", &mut self.topic_byte_limit);
        env_override("STOMPD_EXPIRE_INTERVAL_SECS", &mut self.expire_interval_secs);
        env_override("STOMPD_EXPIRE_LIMIT", &mut self.expire_limit);
        env_override("STOMPD_DEFERRED_INTERVAL_MS", &mut self.deferred_interval_ms);
        env_override("STOMPD_RECOVER_DEAD_INTERVAL_SECS", &mut self.recover_dead_interval_secs);
        env_override("STOMPD_STATS_INTERVAL_SECS", &mut self.stats_interval_secs);
    }

    /// Returns the scheduler interval as Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Returns the queue message timeout as Duration.
    pub fn queue_message_expire(&self) -> Duration {
        Duration::from_secs(self.queue_message_expire_secs)
    }

    /// Exchange settings for destinations of the given kind.
    pub fn exchange_config(&self, kind: DestinationKind) -> ExchangeConfig {
        let byte_limit = match kind {
            DestinationKind::Queue => self.queue_byte_limit,
            DestinationKind::Topic => self.topic_byte_limit,
        };
        ExchangeConfig {
            byte_limit,
            expire_interval: Duration::from_secs(self.expire_interval_secs),
            expire_limit: self.expire_limit,
            deferred_interval: Duration::from_millis(self.deferred_interval_ms),
            recover_dead_interval: Duration::from_secs(self.recover_dead_interval_secs),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            queue: self.exchange_config(DestinationKind::Queue),
            topic: self.exchange_config(DestinationKind::Topic),
            dispatch_limit: self.dispatch_limit,
        }
    }
}

/// Heart-beat negotiation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartBeatConfig {
    /// Smallest interval the client may promise to beat at.
    pub min_expect_ms: u64,
    /// Smallest interval the server beats at.
    pub min_send_ms: u64,
    /// Missed intervals before a peer is dropped.
    pub timeout_factor: u32,
}

impl Default for HeartBeatConfig {
    fn default() -> Self {
        let policy = HeartBeatPolicy::default();
        Self {
            min_expect_ms: policy.min_expect.as_millis() as u64,
            min_send_ms: policy.min_send.as_millis() as u64,
            timeout_factor: policy.timeout_factor,
        }
    }
}

impl HeartBeatConfig {
    fn apply_env_overrides(&mut self) {
        env_override("STOMPD_HEARTBEAT_MIN_EXPECT_MS", &mut self.min_expect_ms);
        env_override("STOMPD_HEARTBEAT_MIN_SEND_MS", &mut self.min_send_ms);
        env_override("STOMPD_HEARTBEAT_TIMEOUT_FACTOR", &mut self.timeout_factor);
    }

    pub fn policy(&self) -> HeartBeatPolicy {
        HeartBeatPolicy {
            min_expect: Duration::from_millis(self.min_expect_ms),
            min_send: Duration::from_millis(self.min_send_ms),
            timeout_factor: self.timeout_factor,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Collect prometheus metrics.
    pub enabled: bool,
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("STOMPD_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 61613);
        assert_eq!(config.broker.queue_byte_limit, 3 * 1024 * 1024);
        assert_eq!(config.broker.queue_message_expire(), Duration::from_secs(3600));
        assert_eq!(config.heartbeat.min_expect_ms, 5000);
        assert_eq!(config.heartbeat.min_send_ms, 1000);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exchange_config_by_kind() {
        let broker = BrokerConfig {
            queue_byte_limit: 10,
            topic_byte_limit: 20,
            deferred_interval_ms: 7,
            ..Default::default()
        };
        assert_eq!(broker.exchange_config(DestinationKind::Queue).byte_limit, 10);
        let topic = broker.exchange_config(DestinationKind::Topic);
        assert_eq!(topic.byte_limit, 20);
        assert_eq!(topic.deferred_interval, Duration::from_millis(7));
        assert_eq!(topic.expire_limit, 20_000);

        let router = broker.router_config();
        assert_eq!(router.dispatch_limit, 100);
        assert_eq!(router.queue.byte_limit, 10);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.broker.expire_limit, config.broker.expire_limit);
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:6000\"\nbroker:\n  max_work: 5\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 6000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.broker.max_work, 5);
        assert_eq!(config.broker.dispatch_limit, 100);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stompd.yaml");
        let mut config = Config::default();
        config.broker.delivery_batch = 42;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.broker.delivery_batch, 42);
    }

    #[test]
    fn test_bad_file_errors() {
        let err = Config::from_file("/nonexistent/stompd.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network: [not, a, map]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.broker.tick_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
