//! Dead-letter handling.
//!
//! Terminal records are either published to the chain's dead-letter topic
//! or, when a [`DltHandler`] is bound, handed to it instead.
//!
//! ## Topic Naming
//!
//! The default dead-letter topic is `{main-topic}-dlt`. Rules that route by
//! failure kind use `{main-topic}{routing-suffix}-dlt`.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::ConsumedRecord;
use crate::destination::TerminalReason;
use crate::failure::ListenerFailure;
use crate::headers::RetryState;

/// Errors returned by a dead-letter handler.
#[derive(Debug, thiserror::Error)]
pub enum DltError {
    #[error("Dead-letter handler failed: {0}")]
    HandlerFailed(String),

    #[error("Dead-letter channel closed")]
    ChannelClosed,
}

/// What happens to terminal records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DltStrategy {
    /// A failing handler is logged and the record acknowledged.
    #[default]
    FailOnError,
    /// A failing handler falls back to publishing on the DLT topic.
    AlwaysRetryOnError,
    /// No dead-letter stage: terminal records are logged and acknowledged.
    NoDlt,
}

/// A record that left the retry chain.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The record as delivered on the stage that gave up.
    pub record: ConsumedRecord,
    /// Retry state including the terminating failure.
    pub state: RetryState,
    pub failure: ListenerFailure,
    pub reason: TerminalReason,
    /// Dead-letter topic the record would have been published to.
    pub destination_topic: String,
}

impl DeadLetter {
    pub fn attempts(&self) -> u32 {
        self.state.attempts
    }

    pub fn original_topic(&self) -> &str {
        &self.state.original_topic
    }
}

/// User-supplied terminal handler.
#[async_trait]
pub trait DltHandler: Send + Sync {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<(), DltError>;
}

/// Handler that only logs.
pub struct LoggingDltHandler;

#[async_trait]
impl DltHandler for LoggingDltHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<(), DltError> {
        warn!(
            topic = %dead_letter.original_topic(),
            offset = dead_letter.state.original_offset,
            attempts = dead_letter.attempts(),
            reason = %dead_letter.reason,
            failure = %dead_letter.failure,
            "Dead letter"
        );
        Ok(())
    }
}

/// Handler that forwards dead letters to a channel.
///
/// Used for standalone mode and testing.
pub struct ChannelDltHandler {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDltHandler {
    /// Returns the handler and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DltHandler for ChannelDltHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<(), DltError> {
        info!(
            topic = %dead_letter.destination_topic,
            reason = %dead_letter.reason,
            "Forwarding dead letter to channel"
        );
        self.sender
            .send(dead_letter)
            .map_err(|_| DltError::ChannelClosed)
    }
}
