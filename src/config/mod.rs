//! Application configuration.
//!
//! Aggregates transport, dispatcher and retry-topic settings into a single
//! Config struct that can be loaded from YAML files or environment variables.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::bus::MessagingConfig;
use crate::classify::FatalKinds;
use crate::destination::{DEFAULT_DLT_SUFFIX, DEFAULT_RETRY_SUFFIX};
use crate::dlt::DltStrategy;
use crate::listener::DispatcherConfig;
use crate::retrytopic::{
    ConfigurationError, RetryTopicConfiguration, RetryTopicConfigurationBuilder, RetryTopicRegistry,
};
use crate::scope::PatternSyntax;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DETOUR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DETOUR";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid retry topic '{name}': {source}")]
    RetryTopic {
        name: String,
        #[source]
        source: ConfigurationError,
    },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub messaging: MessagingConfig,
    pub dispatcher: DispatcherConfig,
    /// Overrides to the process-wide fatal failure kinds.
    pub fatal_kinds: FatalKindsSettings,
    pub retry_topics: Vec<RetryTopicSettings>,
    /// Listeners, used by the helper binary to resolve topic chains.
    pub endpoints: Vec<EndpointSettings>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string, without layering.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The fatal kinds every classifier shares.
    pub fn fatal_kinds(&self) -> Arc<FatalKinds> {
        Arc::new(self.fatal_kinds.resolve())
    }

    /// Build every retry topic configuration into a registry.
    pub fn build_registry(&self) -> Result<RetryTopicRegistry, ConfigError> {
        let fatal = self.fatal_kinds();
        let mut registry = RetryTopicRegistry::new();
        for settings in &self.retry_topics {
            let configuration = settings.build(Arc::clone(&fatal)).map_err(|source| {
                ConfigError::RetryTopic {
                    name: settings.display_name(),
                    source,
                }
            })?;
            registry.register(configuration);
        }
        Ok(registry)
    }
}

/// Additions to and removals from the default fatal kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FatalKindsSettings {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl FatalKindsSettings {
    pub fn resolve(&self) -> FatalKinds {
        let added = self
            .add
            .iter()
            .fold(FatalKinds::default(), |kinds, k| kinds.with(k.clone()));
        self.remove.iter().fold(added, |kinds, k| kinds.without(k))
    }
}

/// Delay strategy, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffSettings {
    None,
    Fixed {
        interval_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_delay_ms")]
        max_ms: u64,
    },
    ExponentialRandom {
        initial_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_delay_ms")]
        max_ms: u64,
        #[serde(default = "default_jitter")]
        jitter: f64,
    },
    UniformRandom {
        min_ms: u64,
        max_ms: u64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    1.0
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self::Fixed { interval_ms: 1_000 }
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        match *settings {
            BackoffSettings::None => BackoffPolicy::None,
            BackoffSettings::Fixed { interval_ms } => BackoffPolicy::Fixed { interval_ms },
            BackoffSettings::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => BackoffPolicy::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            },
            BackoffSettings::ExponentialRandom {
                initial_ms,
                multiplier,
                max_ms,
                jitter,
            } => BackoffPolicy::ExponentialRandom {
                initial_ms,
                multiplier,
                max_ms,
                jitter,
            },
            BackoffSettings::UniformRandom { min_ms, max_ms } => {
                BackoffPolicy::UniformRandom { min_ms, max_ms }
            }
        }
    }
}

/// Topic auto-creation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoCreateSettings {
    pub enabled: bool,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl Default for AutoCreateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            partitions: 1,
            replication_factor: -1,
        }
    }
}

/// Declarative form of one retry topic configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryTopicSettings {
    pub name: Option<String>,
    pub backoff: BackoffSettings,
    pub max_attempts: u32,
    /// Global timeout; omitted or negative disables it.
    pub timeout_ms: Option<i64>,
    /// Kinds to retry; everything else is fatal.
    pub retry_on: Vec<String>,
    /// Kinds never retried.
    pub not_retry_on: Vec<String>,
    pub traverse_causes: bool,
    pub include_topics: Vec<String>,
    pub exclude_topics: Vec<String>,
    pub pattern_syntax: PatternSyntax,
    pub case_sensitive: bool,
    pub auto_create: AutoCreateSettings,
    pub retry_topic_suffix: String,
    pub dlt_topic_suffix: String,
    pub suffix_with_delay_value: bool,
    pub single_topic_for_same_intervals: bool,
    /// Routing suffix to the failure kinds sent to that dead-letter topic.
    pub dlt_routing: BTreeMap<String, Vec<String>>,
    pub dlt_strategy: DltStrategy,
    pub concurrency: Option<usize>,
}

impl Default for RetryTopicSettings {
    fn default() -> Self {
        Self {
            name: None,
            backoff: BackoffSettings::default(),
            max_attempts: crate::retrytopic::DEFAULT_MAX_ATTEMPTS,
            timeout_ms: None,
            retry_on: Vec::new(),
            not_retry_on: Vec::new(),
            traverse_causes: false,
            include_topics: Vec::new(),
            exclude_topics: Vec::new(),
            pattern_syntax: PatternSyntax::default(),
            case_sensitive: true,
            auto_create: AutoCreateSettings::default(),
            retry_topic_suffix: DEFAULT_RETRY_SUFFIX.to_string(),
            dlt_topic_suffix: DEFAULT_DLT_SUFFIX.to_string(),
            suffix_with_delay_value: false,
            single_topic_for_same_intervals: false,
            dlt_routing: BTreeMap::new(),
            dlt_strategy: DltStrategy::default(),
            concurrency: None,
        }
    }
}

impl RetryTopicSettings {
    fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.include_topics.join(","))
    }

    /// Turn the settings into a configuration through the builder.
    pub fn build(&self, fatal: Arc<FatalKinds>) -> Result<RetryTopicConfiguration, ConfigurationError> {
        self.builder(fatal).build()
    }

    fn builder(&self, fatal: Arc<FatalKinds>) -> RetryTopicConfigurationBuilder {
        let mut builder = RetryTopicConfiguration::builder()
            .backoff(BackoffPolicy::from(&self.backoff))
            .max_attempts(self.max_attempts)
            .fatal_kinds(fatal)
            .retry_on(self.retry_on.iter().cloned())
            .not_retry_on(self.not_retry_on.iter().cloned())
            .traversing_causes(self.traverse_causes)
            .include_topics(self.include_topics.iter().cloned())
            .exclude_topics(self.exclude_topics.iter().cloned())
            .pattern_syntax(self.pattern_syntax)
            .case_sensitive(self.case_sensitive)
            .retry_topic_suffix(self.retry_topic_suffix.clone())
            .dlt_topic_suffix(self.dlt_topic_suffix.clone())
            .dlt_strategy(self.dlt_strategy);

        builder = if self.auto_create.enabled {
            builder.auto_create_topics(
                true,
                self.auto_create.partitions,
                self.auto_create.replication_factor,
            )
        } else {
            builder.do_not_auto_create_topics()
        };

        if let Some(ref name) = self.name {
            builder = builder.name(name.clone());
        }
        if let Some(timeout_ms) = self.timeout_ms.and_then(|t| u64::try_from(t).ok()) {
            builder = builder.timeout_ms(timeout_ms);
        }
        if self.suffix_with_delay_value {
            builder = builder.suffix_topics_with_delay_value();
        }
        if self.single_topic_for_same_intervals {
            builder = builder.use_single_topic_for_same_intervals();
        }
        for (suffix, kinds) in &self.dlt_routing {
            builder = builder.dlt_routing(suffix.clone(), kinds.iter().cloned());
        }
        if let Some(concurrency) = self.concurrency {
            builder = builder.concurrency(concurrency);
        }
        builder
    }
}

/// A listener declared in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub id: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub concurrency: Option<usize>,
}

#[cfg(test)]
mod tests;
