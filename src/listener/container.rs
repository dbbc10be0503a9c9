//! Endpoint registration and worker lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backoff::{BackoffPolicy, RepeatingBackoff};
use crate::bus::{BusError, NewTopic, Transport};
use crate::retrytopic::{ConfigurationError, RetryTopicConfiguration, RetryTopicRegistry};

use super::worker::StageWorker;
use super::{DispatcherConfig, RecordHandler};

/// Failures starting a container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Bus(#[from] BusError),
}

/// A listener on one or more main topics.
///
/// The same handler serves every stage of the chain.
#[derive(Clone)]
pub struct RetryEndpoint {
    pub id: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub handler: Arc<dyn RecordHandler>,
    /// Workers per stage. Overrides the configuration and dispatcher default.
    pub concurrency: Option<usize>,
}

impl RetryEndpoint {
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
        handler: Arc<dyn RecordHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            topics,
            handler,
            concurrency: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

impl std::fmt::Debug for RetryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEndpoint")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("topics", &self.topics)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

struct BoundEndpoint {
    endpoint: RetryEndpoint,
    configuration: Arc<RetryTopicConfiguration>,
}

/// Runs one worker pool per consumed chain stage of every endpoint.
pub struct RetryTopicContainer {
    registry: RetryTopicRegistry,
    transport: Transport,
    config: DispatcherConfig,
    endpoints: Vec<BoundEndpoint>,
}

impl RetryTopicContainer {
    pub fn new(registry: RetryTopicRegistry, transport: Transport, config: DispatcherConfig) -> Self {
        Self {
            registry,
            transport,
            config,
            endpoints: Vec::new(),
        }
    }

    pub fn registry(&self) -> &RetryTopicRegistry {
        &self.registry
    }

    /// Bind an endpoint's main topics to their retry configuration.
    ///
    /// Fails if no configuration or more than one covers the topics.
    pub fn add_endpoint(
        &mut self,
        endpoint: RetryEndpoint,
    ) -> Result<Arc<RetryTopicConfiguration>, ConfigurationError> {
        if endpoint.concurrency == Some(0) {
            return Err(ConfigurationError::Invalid(format!(
                "endpoint {} has zero concurrency",
                endpoint.id
            )));
        }
        let configuration = self.registry.bind_topics(&endpoint.topics)?;
        info!(
            endpoint = %endpoint.id,
            topics = ?endpoint.topics,
            configuration = %configuration.name(),
            stages = configuration.chain().stages().len(),
            "Endpoint bound to retry chain"
        );
        self.endpoints.push(BoundEndpoint {
            endpoint,
            configuration: Arc::clone(&configuration),
        });
        Ok(configuration)
    }

    /// Topics the container creates on start.
    pub fn topics_to_create(&self) -> Vec<NewTopic> {
        let mut seen = HashSet::new();
        self.endpoints
            .iter()
            .flat_map(|b| {
                b.endpoint
                    .topics
                    .iter()
                    .flat_map(move |main| b.configuration.topics_to_create(main))
            })
            .filter(|t| seen.insert(t.name.clone()))
            .collect()
    }

    /// Create topics, subscribe every stage and spawn the workers.
    pub async fn start(self) -> Result<ContainerHandle, ContainerError> {
        let topics = self.topics_to_create();
        if !topics.is_empty() {
            self.transport.admin.create_topics(&topics).await?;
            info!(count = topics.len(), "Retry chain topics ensured");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for bound in &self.endpoints {
            let endpoint = &bound.endpoint;
            let configuration = &bound.configuration;

            for (stage_index, stage) in configuration.chain().consumed_stages() {
                let stage_topics: Vec<String> =
                    endpoint.topics.iter().map(|t| stage.topic_for(t)).collect();
                for topic in &stage_topics {
                    self.registry.locate(topic)?;
                }

                let concurrency = if stage.is_main() {
                    endpoint.concurrency
                } else {
                    configuration.concurrency().or(endpoint.concurrency)
                }
                .unwrap_or(self.config.default_concurrency)
                .max(1);
                let group_id = format!("{}{}", endpoint.group_id, stage.suffix);

                for n in 0..concurrency {
                    let consumer = self
                        .transport
                        .consumers
                        .create(&group_id, &stage_topics)
                        .await?;
                    let worker = StageWorker {
                        name: format!("{}{}-{}", endpoint.id, stage.suffix, n),
                        configuration: Arc::clone(configuration),
                        stage_index,
                        consumer,
                        publisher: Arc::clone(&self.transport.publisher),
                        handler: Arc::clone(&endpoint.handler),
                        poll_timeout: Duration::from_millis(self.config.poll_timeout_ms),
                        publish_retry: self.config.publish_retry,
                        redelivery: self.redelivery_backoff(),
                        shutdown: shutdown_rx.clone(),
                    };
                    tasks.push(tokio::spawn(worker.run()));
                }

                info!(
                    endpoint = %endpoint.id,
                    group = %group_id,
                    topics = ?stage_topics,
                    destination = %stage.destination_type,
                    workers = concurrency,
                    "Stage subscribed"
                );
            }
        }

        Ok(ContainerHandle {
            shutdown: shutdown_tx,
            tasks,
        })
    }

    fn redelivery_backoff(&self) -> RepeatingBackoff {
        let policy = BackoffPolicy::Exponential {
            initial_ms: self.config.redelivery_initial_ms,
            multiplier: 2.0,
            max_ms: self.config.redelivery_max_ms,
        };
        RepeatingBackoff::new(policy, self.config.redelivery_max_retries)
    }
}

/// Running container. Dropping it without [`stop`](Self::stop) leaves the
/// workers running until the runtime shuts down.
pub struct ContainerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ContainerHandle {
    /// Signal every worker and wait for them to return their records.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Stage worker panicked");
            }
        }
        info!("Retry topic container stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}
