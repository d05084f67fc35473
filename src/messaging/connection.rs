//! Broker connection lifecycle.
//!
//! A single channel per manager, created lazily on first use and shared by
//! every caller until `close`, or until the broker drops it.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BrokerChannel, BusError, Result};
use crate::config::MessagingConfig;
use crate::utils::retry::{attempt_delays, connection_backoff};

/// A channel handed out by the manager, tagged with the connect that made it.
#[derive(Clone)]
pub struct Session {
    pub channel: Arc<dyn BrokerChannel>,
    /// Starts at 1 and increases on every successful connect.
    pub generation: u64,
}

#[derive(Default)]
struct State {
    current: Option<Session>,
    generation: u64,
}

/// Owns the connection state. A cached open session means ready.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    state: Mutex<State>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: MessagingConfig) -> Self {
        Self {
            broker,
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Return the shared session, connecting first if needed.
    ///
    /// A cached channel the broker has since closed is released and replaced.
    /// Makes up to `connect_attempts` attempts with a fixed delay between them.
    /// The lock is held for the whole attempt loop, so concurrent callers wait
    /// for one connection instead of racing to open several. On failure the
    /// manager stays uninitialized and the next call starts over.
    pub async fn ensure_ready(&self) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.current.as_ref() {
            if session.channel.is_open() {
                return Ok(session.clone());
            }
        }
        if let Some(stale) = state.current.take() {
            warn!(
                generation = stale.generation,
                "Broker channel is no longer open, reconnecting"
            );
            if let Err(e) = stale.channel.close().await {
                debug!(error = %e, "Error releasing dead broker channel");
            }
        }

        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;

        for (index, delay) in attempt_delays(connection_backoff(&self.config)).enumerate() {
            let attempt = index as u32 + 1;
            if attempt > 1 {
                tokio::time::sleep(delay).await;
            }

            match self.broker.connect().await {
                Ok(channel) => {
                    state.generation += 1;
                    let session = Session {
                        channel,
                        generation: state.generation,
                    };
                    info!(
                        attempt,
                        generation = session.generation,
                        "Broker connection established"
                    );
                    state.current = Some(session.clone());
                    return Ok(session);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        retry_in_ms = %self.config.connect_retry_delay().as_millis(),
                        error = %e,
                        "Broker connection attempt failed, retrying..."
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Broker connection attempt failed, giving up"
                    );
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(BusError::Connection(format!(
            "Failed to connect to broker after {} attempts: {}",
            attempts, reason
        )))
    }

    /// Release the channel and connection. No-op when not initialized.
    ///
    /// The manager is uninitialized afterwards even if the release itself
    /// fails; that failure is logged and never returned.
    ///
    /// Shares the lock with `ensure_ready`, so a close issued while a connect
    /// is retrying waits for it to finish, up to
    /// `(connect_attempts - 1) * connect_retry_delay` plus the connect time
    /// itself, and then releases whatever it produced.
    pub async fn close(&self) {
        let Some(session) = self.state.lock().await.current.take() else {
            return;
        };

        match session.channel.close().await {
            Ok(()) => info!("Broker connection closed"),
            Err(e) => error!(error = %e, "Error closing broker connection"),
        }
    }

    /// Whether a session is cached and its channel is still open.
    ///
    /// Like `close`, this waits behind an in-progress `ensure_ready`; it is a
    /// lifecycle query, not a non-blocking health check.
    pub async fn is_ready(&self) -> bool {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .is_some_and(|session| session.channel.is_open())
    }
}
