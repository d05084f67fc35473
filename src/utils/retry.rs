//! Retry utilities: backoff builders for broker connection.
//!
//! Uses `backon` builders. Broker connection retries use a fixed delay so
//! services started alongside the broker (e.g., in docker-compose) get a
//! predictable startup window.

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};

use crate::config::MessagingConfig;

/// Fixed-delay backoff for broker connection at startup.
///
/// Yields one delay per retry, i.e. `connect_attempts - 1` delays, so the
/// total number of attempts equals `connect_attempts`.
pub fn connection_backoff(config: &MessagingConfig) -> ConstantBuilder {
    constant_backoff(
        config.connect_retry_delay(),
        config.connect_attempts.saturating_sub(1) as usize,
    )
}

/// Fixed-delay backoff with the given number of retries.
pub fn constant_backoff(delay: Duration, retries: usize) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(retries)
}

/// Delay schedule for each attempt: zero before the first, then the backoff.
pub fn attempt_delays(builder: ConstantBuilder) -> impl Iterator<Item = Duration> {
    std::iter::once(Duration::ZERO).chain(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_backoff_matches_attempt_budget() {
        let config = MessagingConfig::for_test(5);
        let delays: Vec<_> = attempt_delays(connection_backoff(&config)).collect();

        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::ZERO);
        assert!(delays[1..].iter().all(|d| *d == Duration::from_millis(1)));
    }

    #[test]
    fn test_single_attempt_has_no_retries() {
        let config = MessagingConfig::for_test(1);
        assert_eq!(attempt_delays(connection_backoff(&config)).count(), 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let config = MessagingConfig::for_test(0);
        assert_eq!(attempt_delays(connection_backoff(&config)).count(), 1);
    }
}
