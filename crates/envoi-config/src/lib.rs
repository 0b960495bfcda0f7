//! Envoi Configuration System
//!
//! TOML-based configuration with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Backing store for routes and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redis,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" | "in-memory" => Ok(StorageBackend::Memory),
            other => Err(ConfigError::EnvError(format!("unknown storage backend: {}", other))),
        }
    }
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub ingest: IngestConfig,
    pub delivery: DeliveryConfig,
    pub event_log: EventLogConfig,
    pub storage: StorageBackend,

    /// Routes loaded into the in-memory registry at startup
    pub routes: Vec<RouteSeed>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            redis: RedisConfig::default(),
            auth: AuthConfig::default(),
            ingest: IngestConfig::default(),
            delivery: DeliveryConfig::default(),
            event_log: EventLogConfig::default(),
            storage: StorageBackend::default(),
            routes: Vec::new(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            host: "0.0.0.0".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Shared-secret authentication for the live feed and history API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub api_token: String,
}

/// Ingestion endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Path prefix under which routes are mounted, e.g. `/webhook`
    pub prefix: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            prefix: "/webhook".to_string(),
        }
    }
}

/// Forward scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Number of delivery workers
    pub worker_count: usize,
    /// Bounded task queue size
    pub queue_capacity: usize,
    /// Total attempts per task, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    pub backoff_ms: u64,
    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long shutdown waits for workers to drain
    pub shutdown_grace_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_capacity: 10_000,
            max_attempts: 6,
            backoff_ms: 3_000,
            attempt_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            shutdown_grace_secs: 30,
        }
    }
}

impl DeliveryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Event log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Rolling TTL applied to each route's log (default: 7 days)
    pub retention_secs: u64,
    /// Default page size for the history endpoint
    pub history_limit: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 60 * 60,
            history_limit: 100,
        }
    }
}

impl EventLogConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// A statically configured route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSeed {
    pub path: String,
    pub targets: Vec<String>,
    pub tags: Vec<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.api_token.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.api_token is required (ENVOI_API_TOKEN or API_TOKEN)".to_string(),
            ));
        }
        if !self.ingest.prefix.starts_with('/') || self.ingest.prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "ingest.prefix must look like '/webhook', got '{}'",
                self.ingest.prefix
            )));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.worker_count == 0 || self.delivery.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.worker_count and delivery.queue_capacity must be positive".to_string(),
            ));
        }
        for route in &self.routes {
            if route.path.trim_start_matches('/').is_empty() {
                return Err(ConfigError::ValidationError("route with empty path".to_string()));
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Envoi Configuration
# Environment variables override these settings

storage = "redis"  # redis or memory

[http]
port = 4000
host = "0.0.0.0"
cors_origins = []

[redis]
url = "redis://127.0.0.1:6379"

[auth]
api_token = "change-me"

[ingest]
prefix = "/webhook"

[delivery]
worker_count = 10
queue_capacity = 10000
max_attempts = 6
backoff_ms = 3000
attempt_timeout_ms = 10000
connect_timeout_ms = 5000
shutdown_grace_secs = 30

[event_log]
retention_secs = 604800
history_limit = 100

# Only used with storage = "memory"
[[routes]]
path = "orders"
targets = ["http://localhost:4501/"]
tags = ["shop"]
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.http.port, 4000);
        assert_eq!(config.ingest.prefix, "/webhook");
        assert_eq!(config.delivery.max_attempts, 6);
        assert_eq!(config.delivery.backoff(), Duration::from_secs(3));
        assert_eq!(config.delivery.attempt_timeout(), Duration::from_secs(10));
        assert_eq!(config.event_log.retention(), Duration::from_secs(604_800));
        assert_eq!(config.storage, StorageBackend::Redis);
    }

    #[test]
    fn test_example_toml_parses() {
        let config = AppConfig::from_toml(&AppConfig::example_toml()).unwrap();
        assert_eq!(config.auth.api_token, "change-me");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].targets, vec!["http://localhost:4501/".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
storage = "memory"

[delivery]
worker_count = 2
"#,
        )
        .unwrap();

        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.delivery.worker_count, 2);
        assert_eq!(config.delivery.max_attempts, 6);
        assert_eq!(config.http.port, 4000);
    }

    #[test]
    fn test_validate_requires_token() {
        let config = AppConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config = AppConfig::default();
        config.auth.api_token = "secret".to_string();

        config.ingest.prefix = "webhook".to_string();
        assert!(config.validate().is_err());

        config.ingest.prefix = "/".to_string();
        assert!(config.validate().is_err());

        config.ingest.prefix = "/hooks".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = AppConfig::default();
        config.auth.api_token = "secret".to_string();
        config.delivery.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("Memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!("redis".parse::<StorageBackend>().unwrap(), StorageBackend::Redis);
        assert!("postgres".parse::<StorageBackend>().is_err());
    }
}
