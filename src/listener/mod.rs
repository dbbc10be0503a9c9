//! Delay-aware dispatch.
//!
//! This module contains:
//! - `RecordHandler` trait: user processing for a record
//! - `RetryTopicContainer`: binds endpoints to retry chains and runs one
//!   worker pool per chain stage
//! - The stage worker: waits out each record's due time, invokes the
//!   handler, and republishes failures to the resolved next destination
//! - Dispatcher configuration

mod container;
mod delay;
mod worker;

pub use container::{ContainerError, ContainerHandle, RetryEndpoint, RetryTopicContainer};
pub use delay::{wait_until_due, WaitOutcome};

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::bus::{BusError, ConsumedRecord};
use crate::failure::ListenerFailure;
use crate::utils::retry::PublishRetryConfig;

/// Handler for processing records on any chain stage.
pub trait RecordHandler: Send + Sync {
    /// Process a record. An `Err` sends it down the retry chain.
    fn handle(&self, record: Arc<ConsumedRecord>) -> BoxFuture<'static, Result<(), ListenerFailure>>;
}

/// Adapts an async closure into a [`RecordHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(Arc<ConsumedRecord>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ListenerFailure>> + Send + 'static,
{
    fn handle(&self, record: Arc<ConsumedRecord>) -> BoxFuture<'static, Result<(), ListenerFailure>> {
        Box::pin((self.0)(record))
    }
}

/// Wrap an async closure as a shared handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RecordHandler>
where
    F: Fn(Arc<ConsumedRecord>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerFailure>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Worker-level failures. None of these acknowledge the record.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Interrupted while waiting for the record's due time")]
    Interrupted,

    #[error("Republish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long one poll waits for a record.
    pub poll_timeout_ms: u64,
    /// Workers per stage when neither endpoint nor configuration sets one.
    pub default_concurrency: usize,
    /// Transport-level retry for republishing.
    pub publish_retry: PublishRetryConfig,
    /// First pause after a record could not be republished.
    pub redelivery_initial_ms: u64,
    /// Longest pause between redeliveries of an unpublishable record.
    pub redelivery_max_ms: u64,
    /// Redeliveries before the pause stops growing.
    pub redelivery_max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 500,
            default_concurrency: 1,
            publish_retry: PublishRetryConfig::default(),
            redelivery_initial_ms: 1_000,
            redelivery_max_ms: 30_000,
            redelivery_max_retries: 10,
        }
    }
}
