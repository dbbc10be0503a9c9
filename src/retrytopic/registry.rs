//! Lookup of retry configurations by topic.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::destination::DestinationProperties;

use super::{ConfigurationError, RetryTopicConfiguration};

/// A concrete chain topic: which configuration, main topic and stage it is.
#[derive(Debug, Clone)]
pub struct StageBinding {
    pub configuration: Arc<RetryTopicConfiguration>,
    pub main_topic: String,
    pub stage_index: usize,
}

impl StageBinding {
    pub fn stage(&self) -> &DestinationProperties {
        &self.configuration.chain().stages()[self.stage_index]
    }

    pub fn topic(&self) -> String {
        self.stage().topic_for(&self.main_topic)
    }
}

/// Registered configurations plus the chain topics bound to them.
///
/// Built at startup, then shared read-only.
#[derive(Debug, Default)]
pub struct RetryTopicRegistry {
    configurations: Vec<Arc<RetryTopicConfiguration>>,
    bindings: HashMap<String, StageBinding>,
}

impl RetryTopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, configuration: RetryTopicConfiguration) -> Arc<RetryTopicConfiguration> {
        let configuration = Arc::new(configuration);
        self.configurations.push(Arc::clone(&configuration));
        configuration
    }

    pub fn configurations(&self) -> &[Arc<RetryTopicConfiguration>] {
        &self.configurations
    }

    /// The single configuration governing every topic in `topics`.
    ///
    /// More than one match is an error; none is `Ok(None)`.
    pub fn find_for<S: AsRef<str>>(
        &self,
        topics: &[S],
    ) -> Result<Option<Arc<RetryTopicConfiguration>>, ConfigurationError> {
        let mut matching = self
            .configurations
            .iter()
            .filter(|c| c.has_configuration_for_topics(topics));

        let first = matching.next();
        let others = matching.count();
        if others > 0 {
            return Err(ConfigurationError::AmbiguousScope {
                topics: topics.iter().map(|t| t.as_ref().to_string()).collect(),
                count: others + 1,
            });
        }
        Ok(first.cloned())
    }

    /// Like [`find_for`](Self::find_for), but a missing configuration is an
    /// error naming the first uncovered topic.
    pub fn require_for<S: AsRef<str>>(
        &self,
        topics: &[S],
    ) -> Result<Arc<RetryTopicConfiguration>, ConfigurationError> {
        match self.find_for(topics)? {
            Some(configuration) => Ok(configuration),
            None => {
                let uncovered = topics
                    .iter()
                    .map(AsRef::as_ref)
                    .find(|t| {
                        !self
                            .configurations
                            .iter()
                            .any(|c| c.scope().is_allowed(t))
                    })
                    .or_else(|| topics.first().map(AsRef::as_ref))
                    .unwrap_or_default();
                Err(ConfigurationError::UnconfiguredTopic(uncovered.to_string()))
            }
        }
    }

    /// Resolve the configuration for an endpoint's main topics and bind
    /// every chain topic they produce.
    pub fn bind_topics(
        &mut self,
        main_topics: &[String],
    ) -> Result<Arc<RetryTopicConfiguration>, ConfigurationError> {
        let configuration = self.require_for(main_topics)?;

        for main_topic in main_topics {
            for (stage_index, stage) in configuration.chain().stages().iter().enumerate() {
                let topic = stage.topic_for(main_topic);
                if self.bindings.contains_key(&topic) {
                    return Err(ConfigurationError::DuplicateTopic(topic));
                }
                debug!(
                    topic = %topic,
                    configuration = %configuration.name(),
                    destination = %stage.destination_type,
                    "Bound retry chain topic"
                );
                self.bindings.insert(
                    topic,
                    StageBinding {
                        configuration: Arc::clone(&configuration),
                        main_topic: main_topic.clone(),
                        stage_index,
                    },
                );
            }
        }
        Ok(configuration)
    }

    /// The chain stage a bound topic belongs to.
    pub fn locate(&self, topic: &str) -> Result<&StageBinding, ConfigurationError> {
        self.bindings
            .get(topic)
            .ok_or_else(|| ConfigurationError::UnconfiguredTopic(topic.to_string()))
    }

    /// Every bound chain topic, sorted.
    pub fn bound_topics(&self) -> Vec<&str> {
        let mut topics: Vec<_> = self.bindings.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::DestinationType;

    fn config(name: &str, allow: &[&str]) -> RetryTopicConfiguration {
        RetryTopicConfiguration::builder()
            .name(name)
            .include_topics(allow.iter().copied())
            .build()
            .unwrap()
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_disjoint_scopes_select_one() {
        let mut registry = RetryTopicRegistry::new();
        registry.register(config("orders", &["orders"]));
        registry.register(config("payments", &["payments"]));

        let found = registry.find_for(&["orders"]).unwrap().unwrap();
        assert_eq!(found.name(), "orders");
        let found = registry.find_for(&["payments"]).unwrap().unwrap();
        assert_eq!(found.name(), "payments");
    }

    #[test]
    fn test_overlapping_scopes_are_ambiguous() {
        let mut registry = RetryTopicRegistry::new();
        registry.register(config("a", &["glob:orders*"]));
        registry.register(config("b", &["orders"]));

        match registry.find_for(&["orders"]) {
            Err(ConfigurationError::AmbiguousScope { topics, count }) => {
                assert_eq!(topics, vec!["orders"]);
                assert_eq!(count, 2);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
        assert!(registry.find_for(&["orders-eu"]).unwrap().is_some());
    }

    #[test]
    fn test_multi_topic_endpoint_needs_one_config_for_all() {
        let mut registry = RetryTopicRegistry::new();
        registry.register(config("orders", &["orders"]));
        registry.register(config("payments", &["payments"]));

        assert!(registry.find_for(&["orders", "payments"]).unwrap().is_none());
        match registry.require_for(&["orders", "audit"]) {
            Err(ConfigurationError::UnconfiguredTopic(topic)) => assert_eq!(topic, "audit"),
            other => panic!("expected unconfigured topic, got {:?}", other),
        }
    }

    #[test]
    fn test_bind_and_locate() {
        let mut registry = RetryTopicRegistry::new();
        registry.register(config("orders", &["orders"]));
        registry.bind_topics(&topics(&["orders"])).unwrap();

        assert_eq!(
            registry.bound_topics(),
            vec!["orders", "orders-dlt", "orders-retry-0", "orders-retry-1"]
        );

        let binding = registry.locate("orders-retry-1").unwrap();
        assert_eq!(binding.main_topic, "orders");
        assert_eq!(binding.stage().destination_type, DestinationType::Retry);
        assert_eq!(binding.topic(), "orders-retry-1");

        assert!(matches!(
            registry.locate("payments-retry-0"),
            Err(ConfigurationError::UnconfiguredTopic(_))
        ));
    }

    #[test]
    fn test_binding_same_topic_twice_rejected() {
        let mut registry = RetryTopicRegistry::new();
        registry.register(config("orders", &["orders"]));
        registry.bind_topics(&topics(&["orders"])).unwrap();

        assert!(matches!(
            registry.bind_topics(&topics(&["orders"])),
            Err(ConfigurationError::DuplicateTopic(_))
        ));
    }
}
