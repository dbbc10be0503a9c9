//! Destination topic model.
//!
//! A retry chain is an ordered list of [`DestinationProperties`]: the main
//! topic, zero or more retry stages, and the dead-letter stages. Each stage
//! maps to the topic `<main-topic><suffix>`. Chains are built once per
//! configuration and shared read-only by every worker.

mod chain;
mod resolver;

pub use chain::{ChainSpec, TopicSuffixing};
pub use resolver::{DestinationResolver, Route, TerminalReason};

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::failure::ListenerFailure;
use crate::retrytopic::ConfigurationError;

/// Default suffix for retry stages (`-retry-<n>` after indexing).
pub const DEFAULT_RETRY_SUFFIX: &str = "-retry";
/// Default suffix for the dead-letter stage.
pub const DEFAULT_DLT_SUFFIX: &str = "-dlt";

/// Role of a stage in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationType {
    Main,
    Retry,
    /// A single retry topic re-entered until attempts run out.
    ReusableRetry,
    /// A retry stage reached only after the global timeout has passed.
    RetryWithTimeoutExpired,
    Dlt,
    /// Dead-letter stage selected by failure kind.
    ReroutingDlt,
}

impl DestinationType {
    pub fn is_retry(self) -> bool {
        matches!(
            self,
            Self::Retry | Self::ReusableRetry | Self::RetryWithTimeoutExpired
        )
    }

    pub fn is_dead_letter(self) -> bool {
        matches!(self, Self::Dlt | Self::ReroutingDlt)
    }

    /// Stages a dispatcher consumes from. Dead-letter topics are write-only.
    pub fn is_consumed(self) -> bool {
        !self.is_dead_letter()
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::Retry => "retry",
            Self::ReusableRetry => "reusable-retry",
            Self::RetryWithTimeoutExpired => "retry-timeout-expired",
            Self::Dlt => "dlt",
            Self::ReroutingDlt => "rerouting-dlt",
        };
        f.write_str(name)
    }
}

/// Topic auto-creation parameters for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicCreation {
    pub enabled: bool,
    pub partitions: i32,
    /// `-1` defers to the broker default.
    pub replication_factor: i16,
}

impl Default for TopicCreation {
    fn default() -> Self {
        Self {
            enabled: true,
            partitions: 1,
            replication_factor: -1,
        }
    }
}

impl TopicCreation {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// One dead-letter routing rule: failures of these kinds go to
/// `<main-topic><suffix>-dlt` (or the configured DLT suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DltRoutingRule {
    pub suffix: String,
    pub kinds: BTreeSet<String>,
}

/// Ordered dead-letter routing rules, disjoint by failure kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DltRoutingRules {
    rules: Vec<DltRoutingRule>,
}

impl DltRoutingRules {
    /// Build the rule set, rejecting a kind claimed by two rules.
    pub fn new(rules: Vec<DltRoutingRule>) -> Result<Self, ConfigurationError> {
        for (i, rule) in rules.iter().enumerate() {
            for other in &rules[i + 1..] {
                if let Some(kind) = rule.kinds.intersection(&other.kinds).next() {
                    return Err(ConfigurationError::OverlappingDltRouting {
                        kind: kind.clone(),
                        first: rule.suffix.clone(),
                        second: other.suffix.clone(),
                    });
                }
            }
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[DltRoutingRule] {
        &self.rules
    }

    /// Routing suffix for the first level of `failure` that a rule names.
    ///
    /// Only the outermost failure is consulted unless `traverse_causes`.
    pub fn suffix_for(&self, failure: &ListenerFailure, traverse_causes: bool) -> Option<&str> {
        let depth = if traverse_causes { usize::MAX } else { 1 };
        failure.chain().take(depth).find_map(|level| {
            self.rules
                .iter()
                .find(|rule| rule.kinds.contains(level.kind()))
                .map(|rule| rule.suffix.as_str())
        })
    }
}

/// Immutable description of one chain stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationProperties {
    pub suffix: String,
    /// Delay applied before a record on this stage is processed.
    pub delay_ms: u64,
    pub destination_type: DestinationType,
    /// Attempt budget for the whole chain, carried by every stage.
    ///
    /// Attempts left from this stage onward are this budget minus the
    /// attempts recorded in the record's retry headers.
    pub max_attempts: u32,
    pub auto_create: TopicCreation,
    /// Routing suffix this stage serves, for `ReroutingDlt` stages.
    pub routing_suffix: Option<String>,
    pub dlt_routing: Arc<DltRoutingRules>,
}

impl DestinationProperties {
    /// Topic name for this stage of `main_topic`'s chain.
    pub fn topic_for(&self, main_topic: &str) -> String {
        format!("{}{}", main_topic, self.suffix)
    }

    pub fn is_main(&self) -> bool {
        self.destination_type == DestinationType::Main
    }

    pub fn is_dead_letter(&self) -> bool {
        self.destination_type.is_dead_letter()
    }

    /// Partition a record from `source_partition` should be published to.
    ///
    /// Keeps the source partition when this stage declares enough
    /// partitions; otherwise the broker picks.
    pub fn preserved_partition(&self, source_partition: i32) -> Option<i32> {
        (source_partition >= 0 && source_partition < self.auto_create.partitions)
            .then_some(source_partition)
    }
}

/// Ordered, immutable stages of one retry configuration.
#[derive(Debug, Clone)]
pub struct DestinationChain {
    stages: Vec<DestinationProperties>,
}

impl DestinationChain {
    /// Validate and wrap an ordered stage list.
    ///
    /// The first stage must be the only `Main`; suffixes must be unique; at
    /// most one default DLT; rerouting DLTs require a default DLT.
    pub fn new(stages: Vec<DestinationProperties>) -> Result<Self, ConfigurationError> {
        match stages.first() {
            Some(first) if first.is_main() => {}
            _ => {
                return Err(ConfigurationError::Invalid(
                    "retry chain must start with the main topic".to_string(),
                ))
            }
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.suffix.as_str()) {
                return Err(ConfigurationError::DuplicateSuffix(stage.suffix.clone()));
            }
        }

        let count = |t: DestinationType| {
            stages
                .iter()
                .filter(|s| s.destination_type == t)
                .count()
        };
        if count(DestinationType::Main) != 1 {
            return Err(ConfigurationError::Invalid(
                "retry chain has more than one main stage".to_string(),
            ));
        }
        let dlts = count(DestinationType::Dlt);
        if dlts > 1 {
            return Err(ConfigurationError::Invalid(
                "retry chain has more than one default DLT".to_string(),
            ));
        }
        if dlts == 0 && count(DestinationType::ReroutingDlt) > 0 {
            return Err(ConfigurationError::Invalid(
                "rerouting DLTs require a default DLT".to_string(),
            ));
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[DestinationProperties] {
        &self.stages
    }

    pub fn get(&self, index: usize) -> Option<&DestinationProperties> {
        self.stages.get(index)
    }

    pub fn main(&self) -> &DestinationProperties {
        // Constructor guarantees a main stage at index 0.
        &self.stages[0]
    }

    /// Index of the stage with this suffix.
    pub fn index_of(&self, suffix: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.suffix == suffix)
    }

    pub fn get_by_suffix(&self, suffix: &str) -> Option<&DestinationProperties> {
        self.stages.iter().find(|s| s.suffix == suffix)
    }

    pub fn default_dlt(&self) -> Option<&DestinationProperties> {
        self.stages
            .iter()
            .find(|s| s.destination_type == DestinationType::Dlt)
    }

    /// Dead-letter stage serving the given routing suffix.
    pub fn rerouting_dlt(&self, routing_suffix: &str) -> Option<&DestinationProperties> {
        self.stages.iter().find(|s| {
            s.destination_type == DestinationType::ReroutingDlt
                && s.routing_suffix.as_deref() == Some(routing_suffix)
        })
    }

    /// First retry stage after `index`.
    pub fn next_retry_after(&self, index: usize) -> Option<&DestinationProperties> {
        self.stages
            .iter()
            .skip(index + 1)
            .find(|s| s.destination_type.is_retry())
    }

    /// Number of retry stages.
    pub fn retry_stage_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.destination_type.is_retry())
            .count()
    }

    /// Stages a dispatcher consumes from (main and retries).
    pub fn consumed_stages(&self) -> impl Iterator<Item = (usize, &DestinationProperties)> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.destination_type.is_consumed())
    }

    /// Every topic of `main_topic`'s chain, in chain order.
    pub fn topic_names(&self, main_topic: &str) -> Vec<String> {
        self.stages.iter().map(|s| s.topic_for(main_topic)).collect()
    }
}
