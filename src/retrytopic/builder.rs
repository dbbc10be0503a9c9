//! Fluent builder for [`RetryTopicConfiguration`].

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backoff::BackoffPolicy;
use crate::classify::{ExceptionClassifier, FatalKinds};
use crate::destination::{
    ChainSpec, DestinationResolver, DltRoutingRule, DltRoutingRules, TopicCreation,
    TopicSuffixing, DEFAULT_DLT_SUFFIX, DEFAULT_RETRY_SUFFIX,
};
use crate::dlt::{DltHandler, DltStrategy};
use crate::scope::{PatternSyntax, TopicScopeFilter};

use super::{ConfigurationError, RetryTopicConfiguration};

/// Default attempt budget, main topic included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Builder for [`RetryTopicConfiguration`].
///
/// Defaults: fixed 1s backoff, 3 attempts, no timeout, every topic in
/// scope, `-retry-<n>` / `-dlt` suffixes, topics auto-created with one
/// partition.
pub struct RetryTopicConfigurationBuilder {
    name: Option<String>,
    backoff: BackoffPolicy,
    max_attempts: u32,
    timeout_ms: Option<u64>,
    include: Vec<String>,
    exclude: Vec<String>,
    traverse_causes: bool,
    fatal_kinds: Arc<FatalKinds>,
    allow: Vec<String>,
    deny: Vec<String>,
    pattern_syntax: PatternSyntax,
    case_sensitive: bool,
    topic_creation: TopicCreation,
    dlt_routing: Vec<DltRoutingRule>,
    dlt_handler: Option<Arc<dyn DltHandler>>,
    dlt_strategy: DltStrategy,
    retry_suffix: String,
    dlt_suffix: String,
    suffixing: TopicSuffixing,
    reuse_fixed_interval_topic: bool,
    concurrency: Option<usize>,
}

impl Default for RetryTopicConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryTopicConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_ms: None,
            include: Vec::new(),
            exclude: Vec::new(),
            traverse_causes: false,
            fatal_kinds: Arc::new(FatalKinds::default()),
            allow: Vec::new(),
            deny: Vec::new(),
            pattern_syntax: PatternSyntax::Exact,
            case_sensitive: true,
            topic_creation: TopicCreation::default(),
            dlt_routing: Vec::new(),
            dlt_handler: None,
            dlt_strategy: DltStrategy::default(),
            retry_suffix: DEFAULT_RETRY_SUFFIX.to_string(),
            dlt_suffix: DEFAULT_DLT_SUFFIX.to_string(),
            suffixing: TopicSuffixing::Index,
            reuse_fixed_interval_topic: false,
            concurrency: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    // ------------------------------------------------------------------
    // Backoff and attempts
    // ------------------------------------------------------------------

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn fixed_backoff(self, interval_ms: u64) -> Self {
        self.backoff(BackoffPolicy::fixed(interval_ms))
    }

    pub fn exponential_backoff(self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.backoff(BackoffPolicy::Exponential {
            initial_ms,
            multiplier,
            max_ms,
        })
    }

    pub fn no_backoff(self) -> Self {
        self.backoff(BackoffPolicy::None)
    }

    /// Total attempts, the main topic's included.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Route to the DLT once this long has passed since the first attempt.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    /// Retry only these failure kinds.
    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(kinds.into_iter().map(Into::into));
        self
    }

    /// Never retry these failure kinds.
    pub fn not_retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn traversing_causes(mut self, traverse: bool) -> Self {
        self.traverse_causes = traverse;
        self
    }

    /// Process-wide fatal kinds to classify against.
    pub fn fatal_kinds(mut self, fatal: Arc<FatalKinds>) -> Self {
        self.fatal_kinds = fatal;
        self
    }

    // ------------------------------------------------------------------
    // Topic scope
    // ------------------------------------------------------------------

    pub fn include_topic(mut self, pattern: impl Into<String>) -> Self {
        self.allow.push(pattern.into());
        self
    }

    pub fn include_topics<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn exclude_topic(mut self, pattern: impl Into<String>) -> Self {
        self.deny.push(pattern.into());
        self
    }

    pub fn exclude_topics<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Syntax for patterns without a `glob:` / `regex:` / `exact:` prefix.
    pub fn pattern_syntax(mut self, syntax: PatternSyntax) -> Self {
        self.pattern_syntax = syntax;
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    pub fn auto_create_topics(mut self, enabled: bool, partitions: i32, replication_factor: i16) -> Self {
        self.topic_creation = TopicCreation {
            enabled,
            partitions,
            replication_factor,
        };
        self
    }

    pub fn do_not_auto_create_topics(mut self) -> Self {
        self.topic_creation.enabled = false;
        self
    }

    pub fn retry_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.retry_suffix = suffix.into();
        self
    }

    pub fn dlt_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dlt_suffix = suffix.into();
        self
    }

    pub fn suffix_topics_with_delay_value(mut self) -> Self {
        self.suffixing = TopicSuffixing::DelayValue;
        self
    }

    /// Use one re-entered retry topic when every delay is the same.
    pub fn use_single_topic_for_same_intervals(mut self) -> Self {
        self.reuse_fixed_interval_topic = true;
        self
    }

    // ------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------

    /// Send terminal failures of these kinds to `<topic><suffix>-dlt`.
    pub fn dlt_routing<I, S>(mut self, suffix: impl Into<String>, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dlt_routing.push(DltRoutingRule {
            suffix: suffix.into(),
            kinds: kinds.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
        });
        self
    }

    pub fn dlt_handler(mut self, handler: Arc<dyn DltHandler>) -> Self {
        self.dlt_handler = Some(handler);
        self
    }

    pub fn dlt_strategy(mut self, strategy: DltStrategy) -> Self {
        self.dlt_strategy = strategy;
        self
    }

    pub fn do_not_configure_dlt(self) -> Self {
        self.dlt_strategy(DltStrategy::NoDlt)
    }

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------

    /// Workers per retry stage.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RetryTopicConfiguration, ConfigurationError> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(ConfigurationError::Invalid(
                "retry_on and not_retry_on are mutually exclusive".to_string(),
            ));
        }
        if self.concurrency == Some(0) {
            return Err(ConfigurationError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let scope = TopicScopeFilter::from_patterns(
            &self.allow,
            &self.deny,
            self.pattern_syntax,
            self.case_sensitive,
        )?;

        let chain = ChainSpec {
            backoff: self.backoff,
            max_attempts: self.max_attempts,
            timeout_ms: self.timeout_ms,
            retry_suffix: self.retry_suffix,
            dlt_suffix: self.dlt_suffix,
            suffixing: self.suffixing,
            reuse_fixed_interval_topic: self.reuse_fixed_interval_topic,
            include_dlt: self.dlt_strategy != DltStrategy::NoDlt,
            topic_creation: self.topic_creation,
            dlt_routing: DltRoutingRules::new(self.dlt_routing)?,
        }
        .build()?;
        let chain = Arc::new(chain);

        let classifier = ExceptionClassifier::new(self.fatal_kinds)
            .with_include(self.include)
            .with_exclude(self.exclude)
            .with_traverse_causes(self.traverse_causes);

        let name = self.name.unwrap_or_else(|| {
            if self.allow.is_empty() {
                "*".to_string()
            } else {
                self.allow.join(",")
            }
        });

        Ok(RetryTopicConfiguration {
            name,
            resolver: DestinationResolver::new(Arc::clone(&chain), classifier, self.timeout_ms),
            chain,
            scope,
            dlt_handler: self.dlt_handler,
            dlt_strategy: self.dlt_strategy,
            concurrency: self.concurrency,
            timeout_ms: self.timeout_ms,
            topic_creation: self.topic_creation,
        })
    }
}
