//! Retry topic configuration.
//!
//! A [`RetryTopicConfiguration`] is the immutable unit the dispatcher runs:
//! the destination chain and its resolver, the topic scope it governs, an
//! optional dead-letter handler, topic auto-creation and concurrency.
//! Configurations are assembled with [`RetryTopicConfigurationBuilder`] and
//! looked up by topic through a [`RetryTopicRegistry`].

mod builder;
mod error;
mod registry;

pub use builder::{RetryTopicConfigurationBuilder, DEFAULT_MAX_ATTEMPTS};
pub use error::ConfigurationError;
pub use registry::{RetryTopicRegistry, StageBinding};

use std::fmt;
use std::sync::Arc;

use crate::bus::NewTopic;
use crate::destination::{DestinationChain, DestinationResolver, TopicCreation};
use crate::dlt::{DltHandler, DltStrategy};
use crate::scope::TopicScopeFilter;

/// Retry behavior for one set of topics.
#[derive(Clone)]
pub struct RetryTopicConfiguration {
    name: String,
    chain: Arc<DestinationChain>,
    resolver: DestinationResolver,
    scope: TopicScopeFilter,
    dlt_handler: Option<Arc<dyn DltHandler>>,
    dlt_strategy: DltStrategy,
    concurrency: Option<usize>,
    timeout_ms: Option<u64>,
    topic_creation: TopicCreation,
}

impl fmt::Debug for RetryTopicConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTopicConfiguration")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .field("scope", &self.scope)
            .field("dlt_handler", &self.dlt_handler.is_some())
            .field("dlt_strategy", &self.dlt_strategy)
            .field("concurrency", &self.concurrency)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl RetryTopicConfiguration {
    pub fn builder() -> RetryTopicConfigurationBuilder {
        RetryTopicConfigurationBuilder::new()
    }

    /// Name used in logs and error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &DestinationChain {
        &self.chain
    }

    pub fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }

    pub fn scope(&self) -> &TopicScopeFilter {
        &self.scope
    }

    pub fn dlt_handler(&self) -> Option<&Arc<dyn DltHandler>> {
        self.dlt_handler.as_ref()
    }

    pub fn dlt_strategy(&self) -> DltStrategy {
        self.dlt_strategy
    }

    /// Worker count for each retry stage, if set.
    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Global timeout, `None` when disabled.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    pub fn topic_creation(&self) -> TopicCreation {
        self.topic_creation
    }

    /// Whether this configuration governs every topic in `topics`.
    pub fn has_configuration_for_topics<S: AsRef<str>>(&self, topics: &[S]) -> bool {
        self.scope.applies(topics)
    }

    /// Every topic of `main_topic`'s chain, to create if absent.
    ///
    /// Empty when auto-creation is disabled.
    pub fn topics_to_create(&self, main_topic: &str) -> Vec<NewTopic> {
        if !self.topic_creation.enabled {
            return Vec::new();
        }
        self.chain
            .stages()
            .iter()
            .map(|s| NewTopic {
                name: s.topic_for(main_topic),
                partitions: s.auto_create.partitions,
                replication_factor: s.auto_create.replication_factor,
            })
            .collect()
    }
}
