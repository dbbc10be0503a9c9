//! Chain construction from backoff, attempt budget and naming options.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backoff::{BackoffDelay, BackoffPolicy};
use crate::retrytopic::ConfigurationError;

use super::{
    DestinationChain, DestinationProperties, DestinationType, DltRoutingRules, TopicCreation,
    DEFAULT_DLT_SUFFIX, DEFAULT_RETRY_SUFFIX,
};

/// How retry stage suffixes are numbered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TopicSuffixing {
    /// `-retry-0`, `-retry-1`, ...
    #[default]
    Index,
    /// `-retry-1000`, `-retry-2000`, ...; repeated delays get `-<n>` appended.
    DelayValue,
}

/// Inputs for building a [`DestinationChain`].
#[derive(Debug, Clone)]
pub struct ChainSpec {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
    /// `None` disables the global timeout.
    pub timeout_ms: Option<u64>,
    pub retry_suffix: String,
    pub dlt_suffix: String,
    pub suffixing: TopicSuffixing,
    /// Collapse fixed-interval retries into one re-entered topic.
    pub reuse_fixed_interval_topic: bool,
    pub include_dlt: bool,
    pub topic_creation: TopicCreation,
    pub dlt_routing: DltRoutingRules,
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 3,
            timeout_ms: None,
            retry_suffix: DEFAULT_RETRY_SUFFIX.to_string(),
            dlt_suffix: DEFAULT_DLT_SUFFIX.to_string(),
            suffixing: TopicSuffixing::Index,
            reuse_fixed_interval_topic: false,
            include_dlt: true,
            topic_creation: TopicCreation::default(),
            dlt_routing: DltRoutingRules::default(),
        }
    }
}

impl ChainSpec {
    /// Build the chain.
    ///
    /// Retry delays are sampled here, once, so randomized policies fix one
    /// delay per stage. A custom policy that stops early shortens the chain
    /// and lowers the attempt budget to match.
    pub fn build(&self) -> Result<DestinationChain, ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.topic_creation.partitions < 1 {
            return Err(ConfigurationError::Invalid(format!(
                "topic partitions must be at least 1, got {}",
                self.topic_creation.partitions
            )));
        }
        if self.dlt_suffix.is_empty() {
            return Err(ConfigurationError::Invalid(
                "DLT suffix must not be empty".to_string(),
            ));
        }

        let delays = self.sample_delays();
        let routing = Arc::new(self.dlt_routing.clone());
        let reuse = self.reuse_fixed_interval_topic && self.backoff.is_constant() && delays.len() > 1;
        let max_attempts = if reuse {
            self.max_attempts
        } else {
            u32::try_from(delays.len()).unwrap_or(u32::MAX).saturating_add(1)
        };

        let stage = |suffix: String, delay_ms: u64, destination_type: DestinationType| {
            DestinationProperties {
                suffix,
                delay_ms,
                destination_type,
                max_attempts,
                auto_create: self.topic_creation,
                routing_suffix: None,
                dlt_routing: Arc::clone(&routing),
            }
        };

        let mut stages = vec![stage(String::new(), 0, DestinationType::Main)];

        if reuse {
            stages.push(stage(
                self.retry_suffix.clone(),
                delays[0],
                DestinationType::ReusableRetry,
            ));
        } else {
            let mut cumulative: u64 = 0;
            for (suffix, delay) in self.retry_suffixes(&delays).into_iter().zip(&delays) {
                cumulative = cumulative.saturating_add(*delay);
                let destination_type = match self.timeout_ms {
                    Some(timeout) if cumulative > timeout => DestinationType::RetryWithTimeoutExpired,
                    _ => DestinationType::Retry,
                };
                stages.push(stage(suffix, *delay, destination_type));
            }
        }

        if self.include_dlt {
            for rule in self.dlt_routing.rules() {
                let mut rerouting = stage(
                    format!("{}{}", rule.suffix, self.dlt_suffix),
                    0,
                    DestinationType::ReroutingDlt,
                );
                rerouting.routing_suffix = Some(rule.suffix.clone());
                stages.push(rerouting);
            }
            stages.push(stage(self.dlt_suffix.clone(), 0, DestinationType::Dlt));
        }

        DestinationChain::new(stages)
    }

    fn sample_delays(&self) -> Vec<u64> {
        let mut execution = self.backoff.start(self.max_attempts - 1);
        let mut delays = Vec::new();
        while let BackoffDelay::Millis(ms) = execution.next_delay() {
            delays.push(ms);
        }
        delays
    }

    fn retry_suffixes(&self, delays: &[u64]) -> Vec<String> {
        match self.suffixing {
            TopicSuffixing::Index => (0..delays.len())
                .map(|i| format!("{}-{}", self.retry_suffix, i))
                .collect(),
            TopicSuffixing::DelayValue => {
                let mut seen: HashMap<u64, usize> = HashMap::new();
                delays
                    .iter()
                    .map(|delay| {
                        let repeats = seen.entry(*delay).or_insert(0);
                        let suffix = if *repeats == 0 {
                            format!("{}-{}", self.retry_suffix, delay)
                        } else {
                            format!("{}-{}-{}", self.retry_suffix, delay, repeats)
                        };
                        *repeats += 1;
                        suffix
                    })
                    .collect()
            }
        }
    }
}
