//! Bootstrap utilities for detour binaries.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;

/// Environment variable holding the tracing filter.
pub const LOG_ENV_VAR: &str = "DETOUR_LOG";

/// Initialize tracing with the DETOUR_LOG environment variable.
///
/// Defaults to "info" level if DETOUR_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a broker with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "kafka")
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max retries.
pub async fn connect_with_retry<T, E, F, Fut>(service_name: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let connection = connect
        .retry(connection_backoff())
        .notify(|err: &E, dur: Duration| {
            warn!(service = %service_name, error = %err, delay = ?dur, "Connection failed, retrying");
        })
        .await?;
    info!(service = %service_name, "Connected");
    Ok(connection)
}
