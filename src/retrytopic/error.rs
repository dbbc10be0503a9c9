/// Errors building or looking up retry configurations.
///
/// All of these are startup errors: they name the topic or rule to fix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Topics {topics:?} are claimed by {count} retry configurations; exactly one may apply")]
    AmbiguousScope { topics: Vec<String>, count: usize },

    #[error("Failure kind '{kind}' is routed by both '{first}' and '{second}'")]
    OverlappingDltRouting {
        kind: String,
        first: String,
        second: String,
    },

    #[error("No retry configuration covers topic '{0}'")]
    UnconfiguredTopic(String),

    #[error("Duplicate destination suffix '{0}' in retry chain")]
    DuplicateSuffix(String),

    #[error("Topic '{0}' is bound to more than one retry chain stage")]
    DuplicateTopic(String),

    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid retry configuration: {0}")]
    Invalid(String),
}
