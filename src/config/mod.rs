//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod logging;
mod messaging;

pub use logging::LoggingConfig;
pub use messaging::MessagingConfig;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SERVICE_ESSENTIALS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SERVICE_ESSENTIALS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SERVICE_ESSENTIALS_LOG";
/// Legacy environment variable for the broker URL.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";
/// Legacy environment variable for the default notifications queue.
pub const NOTIFICATIONS_QUEUE_ENV_VAR: &str = "NOTIFICATIONS_QUEUE";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker and RPC configuration.
    pub messaging: MessagingConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy `RABBITMQ_URL` / `NOTIFICATIONS_QUEUE` variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("messaging.url", std::env::var(RABBITMQ_URL_ENV_VAR).ok())?
            .set_override_option(
                "messaging.notifications_queue",
                std::env::var(NOTIFICATIONS_QUEUE_ENV_VAR).ok(),
            )?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for var in [
            CONFIG_ENV_VAR,
            RABBITMQ_URL_ENV_VAR,
            NOTIFICATIONS_QUEUE_ENV_VAR,
            "SERVICE_ESSENTIALS__MESSAGING__CONNECT_ATTEMPTS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.url, "amqp://localhost:5672");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.production);
    }

    #[test]
    #[serial]
    fn test_load_without_sources_uses_defaults() {
        clear_env();
        let config = Config::load(None).unwrap();
        assert_eq!(config.messaging.notifications_queue, "NOTIFICATIONS_QUEUE");
        assert_eq!(config.messaging.connect_attempts, 5);
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "messaging:\n  url: amqp://broker:5672\n  rpc_timeout_ms: 250\nlogging:\n  production: true"
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.messaging.url, "amqp://broker:5672");
        assert_eq!(config.messaging.rpc_timeout_ms, 250);
        assert!(config.logging.production);
    }

    #[test]
    #[serial]
    fn test_load_from_config_env_var_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "messaging:\n  notifications_queue: FROM_ENV_FILE\n  connect_attempts: 2"
        )
        .unwrap();
        std::env::set_var(CONFIG_ENV_VAR, file.path());

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.messaging.notifications_queue, "FROM_ENV_FILE");
        assert_eq!(config.messaging.connect_attempts, 2);
    }

    #[test]
    #[serial]
    fn test_config_env_var_file_overrides_explicit_path() {
        clear_env();
        let mut explicit = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(explicit, "messaging:\n  url: amqp://explicit:5672\n  rpc_timeout_ms: 250").unwrap();
        let mut from_env = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(from_env, "messaging:\n  url: amqp://from-env:5672").unwrap();
        std::env::set_var(CONFIG_ENV_VAR, from_env.path());

        let config = Config::load(Some(explicit.path().to_str().unwrap())).unwrap();
        clear_env();

        assert_eq!(config.messaging.url, "amqp://from-env:5672");
        assert_eq!(config.messaging.rpc_timeout_ms, 250);
    }

    #[test]
    #[serial]
    fn test_legacy_env_vars_override() {
        clear_env();
        std::env::set_var(RABBITMQ_URL_ENV_VAR, "amqp://legacy:5672");
        std::env::set_var(NOTIFICATIONS_QUEUE_ENV_VAR, "ALERTS");

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.messaging.url, "amqp://legacy:5672");
        assert_eq!(config.messaging.notifications_queue, "ALERTS");
    }

    #[test]
    #[serial]
    fn test_prefixed_env_vars_override() {
        clear_env();
        std::env::set_var("SERVICE_ESSENTIALS__MESSAGING__CONNECT_ATTEMPTS", "9");

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.messaging.connect_attempts, 9);
    }
}
