//! Shared helpers.
//!
//! Small pieces used by the dispatcher and the binaries.

pub mod bootstrap;
pub mod retry;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
