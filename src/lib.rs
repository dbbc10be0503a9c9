//! Detour - non-blocking retries over retry and dead-letter topics
//!
//! A failed record is republished to a chain of delayed retry topics and,
//! once its attempts run out or it fails fatally, to a dead-letter topic.
//! The main topic keeps flowing while the record waits on its retry stage.

pub mod backoff;
pub mod bus;
pub mod classify;
pub mod config;
pub mod destination;
pub mod dlt;
pub mod failure;
pub mod headers;
pub mod listener;
pub mod retrytopic;
pub mod scope;
pub mod utils;

pub use backoff::{BackoffDelay, BackoffPolicy};
pub use bus::{ConsumedRecord, InMemoryBroker, OutgoingRecord, Transport};
pub use classify::{Classification, ExceptionClassifier, FatalKinds};
pub use destination::{DestinationProperties, DestinationType, Route, TerminalReason};
pub use dlt::{DeadLetter, DltHandler, DltStrategy};
pub use failure::ListenerFailure;
pub use listener::{handler_fn, RecordHandler, RetryEndpoint, RetryTopicContainer};
pub use retrytopic::{ConfigurationError, RetryTopicConfiguration, RetryTopicRegistry};
