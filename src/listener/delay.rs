//! Due-time enforcement.
//!
//! A worker holding a record that is not yet due pauses its consumer and
//! sleeps in short slices, issuing a zero-timeout keep-alive poll between
//! slices so the group does not evict it during a long wait.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::bus::{RecordConsumer, Result};
use crate::utils::now_millis;

/// Slice length for waits of at most [`SMALL_WAIT_THRESHOLD`].
pub const SMALL_SLEEP_INTERVAL: Duration = Duration::from_millis(10);
/// Slice length for longer waits.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_millis(100);
pub const SMALL_WAIT_THRESHOLD: Duration = Duration::from_millis(500);

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The due time has passed.
    Due,
    /// Shutdown was requested; the record must stay unacknowledged.
    Interrupted,
}

/// Wait until `due_at_ms`, or until `shutdown` fires.
///
/// The consumer is paused for the wait and resumed afterwards, also when
/// interrupted.
pub async fn wait_until_due(
    consumer: &mut dyn RecordConsumer,
    due_at_ms: i64,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<WaitOutcome> {
    let remaining = due_at_ms.saturating_sub(now_millis());
    if remaining <= 0 {
        return Ok(WaitOutcome::Due);
    }

    let slice = if Duration::from_millis(remaining as u64) > SMALL_WAIT_THRESHOLD {
        DEFAULT_SLEEP_INTERVAL
    } else {
        SMALL_SLEEP_INTERVAL
    };
    debug!(remaining_ms = remaining, slice_ms = slice.as_millis() as u64, "Waiting for due time");

    consumer.pause_all()?;
    let outcome = sleep_in_slices(consumer, due_at_ms, slice, shutdown).await;
    let resumed = consumer.resume_all();
    let outcome = outcome?;
    resumed?;
    Ok(outcome)
}

async fn sleep_in_slices(
    consumer: &mut dyn RecordConsumer,
    due_at_ms: i64,
    slice: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<WaitOutcome> {
    let mut first_slice = true;
    loop {
        if *shutdown.borrow() {
            return Ok(WaitOutcome::Interrupted);
        }

        tokio::select! {
            _ = tokio::time::sleep(slice) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(WaitOutcome::Interrupted);
                }
            }
        }

        if now_millis() >= due_at_ms {
            return Ok(WaitOutcome::Due);
        }
        if first_slice {
            first_slice = false;
        } else {
            consumer.keep_alive()?;
        }
    }
}
