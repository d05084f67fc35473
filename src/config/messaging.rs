//! Messaging and broker configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Broker and RPC configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Queue used by `MessagingService::notify`.
    pub notifications_queue: String,
    /// Connection attempts before `ensure_ready` gives up.
    pub connect_attempts: u32,
    /// Fixed delay between connection attempts, in milliseconds.
    pub connect_retry_delay_ms: u64,
    /// How long a pending RPC waits for its reply, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Interval of the expired-request sweep, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            notifications_queue: "NOTIFICATIONS_QUEUE".to_string(),
            connect_attempts: 5,
            connect_retry_delay_ms: 2000,
            rpc_timeout_ms: 30_000,
            sweep_interval_ms: 5000,
        }
    }
}

impl MessagingConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Config for tests: one millisecond retry delay, given attempt budget.
    pub fn for_test(connect_attempts: u32) -> Self {
        Self {
            connect_attempts,
            connect_retry_delay_ms: 1,
            ..Default::default()
        }
    }
}
