//! Transport-level retry: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Republishing a record
//! to its next destination retries through [`publish_backoff`] before the
//! worker gives up on the record and leaves it unacknowledged.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::bus::BusError;

/// Republish retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublishRetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_times: usize,
}

impl Default for PublishRetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 50,
            max_delay_ms: 2_000,
            max_times: 5,
        }
    }
}

/// Backoff for republishing a failed record to its next destination.
///
/// - Min delay: `min_delay_ms` (default 50ms)
/// - Max delay: `max_delay_ms` (default 2s)
/// - Max attempts: `max_times` (default 5)
/// - Jitter enabled
pub fn publish_backoff(config: &PublishRetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_times)
        .with_jitter()
}

/// Backoff for broker connections at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Determines if a bus error may succeed on retry.
///
/// Retryable:
/// - `Connection`, `Publish`: broker unavailable or publish timed out
///
/// Non-retryable: subscription, admin and closed-consumer errors need a
/// restart, not another attempt.
pub fn is_retryable_bus_error(err: &BusError) -> bool {
    matches!(err, BusError::Connection(_) | BusError::Publish(_))
}
