//! Bootstrap utilities for services using this crate.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LoggingConfig, LOG_ENV_VAR};

/// Initialize tracing with the SERVICE_ESSENTIALS_LOG environment variable.
///
/// Falls back to `config.level` if the variable is not set. Production mode
/// writes JSON lines; development mode writes human-readable output.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.production {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only test in this binary that installs a global subscriber.
    #[test]
    fn test_init_tracing_production_json() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            production: true,
        };
        init_tracing(&config);
        tracing::info!(queue = "Q", "Subscriber installed");
    }
}
