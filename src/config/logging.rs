//! Logging configuration types.

use serde::Deserialize;

/// Tracing subscriber configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `LOG_ENV_VAR` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub production: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            production: false,
        }
    }
}
