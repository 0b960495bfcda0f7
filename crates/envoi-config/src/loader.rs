//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "envoi.toml",
    "./config/config.toml",
    "/etc/envoi/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate it.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a custom variable lookup.
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup) {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching defaults");
        }

        if let Some(path) = lookup("ENVOI_CONFIG").map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{} has an invalid value: {}", key, value)))
}

/// Apply environment variable overrides.
///
/// `ENVOI_*` variables win over the unprefixed names (`PORT`, `API_TOKEN`,
/// `REDIS_HOST`/`REDIS_PORT`) that older deployments set.
fn apply_overrides<F>(config: &mut AppConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // HTTP
    if let Some(val) = lookup("ENVOI_HTTP_PORT").or_else(|| lookup("PORT")) {
        config.http.port = parse_var("ENVOI_HTTP_PORT", val)?;
    }
    if let Some(val) = lookup("ENVOI_HTTP_HOST") {
        config.http.host = val;
    }
    if let Some(val) = lookup("ENVOI_CORS_ORIGINS") {
        config.http.cors_origins = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // Redis
    if let Some(val) = lookup("ENVOI_REDIS_URL") {
        config.redis.url = val;
    } else if let Some(host) = lookup("REDIS_HOST") {
        let port: u16 = match lookup("REDIS_PORT") {
            Some(val) => parse_var("REDIS_PORT", val)?,
            None => 6379,
        };
        config.redis.url = format!("redis://{}:{}", host, port);
    }

    // Auth
    if let Some(val) = lookup("ENVOI_API_TOKEN").or_else(|| lookup("API_TOKEN")) {
        config.auth.api_token = val;
    }

    // Ingest
    if let Some(val) = lookup("ENVOI_INGEST_PREFIX") {
        config.ingest.prefix = val;
    }
    if let Some(val) = lookup("ENVOI_STORAGE") {
        config.storage = val.parse()?;
    }

    // Delivery
    if let Some(val) = lookup("ENVOI_DELIVERY_WORKERS") {
        config.delivery.worker_count = parse_var("ENVOI_DELIVERY_WORKERS", val)?;
    }
    if let Some(val) = lookup("ENVOI_DELIVERY_MAX_ATTEMPTS") {
        config.delivery.max_attempts = parse_var("ENVOI_DELIVERY_MAX_ATTEMPTS", val)?;
    }
    if let Some(val) = lookup("ENVOI_DELIVERY_BACKOFF_MS") {
        config.delivery.backoff_ms = parse_var("ENVOI_DELIVERY_BACKOFF_MS", val)?;
    }
    if let Some(val) = lookup("ENVOI_DELIVERY_TIMEOUT_MS") {
        config.delivery.attempt_timeout_ms = parse_var("ENVOI_DELIVERY_TIMEOUT_MS", val)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageBackend;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_env_only_configuration() {
        let env = vars(&[("API_TOKEN", "secret"), ("PORT", "4100")]);
        let config = ConfigLoader::with_path("/nonexistent/envoi.toml")
            .load_with(|k| env.get(k).cloned())
            .unwrap();

        assert_eq!(config.auth.api_token, "secret");
        assert_eq!(config.http.port, 4100);
    }

    #[test]
    fn test_prefixed_vars_win() {
        let env = vars(&[
            ("API_TOKEN", "legacy"),
            ("ENVOI_API_TOKEN", "current"),
            ("PORT", "1"),
            ("ENVOI_HTTP_PORT", "4200"),
        ]);
        let config = ConfigLoader::with_path("/nonexistent/envoi.toml")
            .load_with(|k| env.get(k).cloned())
            .unwrap();

        assert_eq!(config.auth.api_token, "current");
        assert_eq!(config.http.port, 4200);
    }

    #[test]
    fn test_redis_host_and_port() {
        let env = vars(&[("API_TOKEN", "t"), ("REDIS_HOST", "cache"), ("REDIS_PORT", "6380")]);
        let config = ConfigLoader::with_path("/nonexistent/envoi.toml")
            .load_with(|k| env.get(k).cloned())
            .unwrap();

        assert_eq!(config.redis.url, "redis://cache:6380");
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let env = vars(&[("API_TOKEN", "t"), ("ENVOI_DELIVERY_WORKERS", "many")]);
        let result = ConfigLoader::with_path("/nonexistent/envoi.toml")
            .load_with(|k| env.get(k).cloned());

        assert!(matches!(result, Err(ConfigError::EnvError(_))));
    }

    #[test]
    fn test_missing_token_fails_validation() {
        let env: HashMap<String, String> = HashMap::new();
        let result = ConfigLoader::with_path("/nonexistent/envoi.toml")
            .load_with(|k| env.get(k).cloned());

        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
storage = "memory"

[auth]
api_token = "from-file"

[delivery]
max_attempts = 3

[[routes]]
path = "orders"
targets = ["https://a.test/hook"]
"#
        )
        .unwrap();

        let env = vars(&[("ENVOI_DELIVERY_MAX_ATTEMPTS", "4")]);
        let config = ConfigLoader::with_path(file.path())
            .load_with(|k| env.get(k).cloned())
            .unwrap();

        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.auth.api_token, "from-file");
        assert_eq!(config.delivery.max_attempts, 4);
        assert_eq!(config.routes[0].path, "orders");
    }
}
