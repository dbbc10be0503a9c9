//! Record transport.
//!
//! This module contains:
//! - `RecordPublisher` / `RecordConsumer` traits: the broker seam the
//!   dispatcher drives
//! - `ConsumerFactory` / `TopicAdmin`: per-worker consumers and topic creation
//! - Messaging configuration types
//! - Implementations: in-memory broker, Kafka

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaAdmin, KafkaConsumerFactory, KafkaPublisher, KafkaTransportConfig};
pub use memory::InMemoryBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Topic administration failed: {0}")]
    Admin(String),

    #[error("Consumer closed")]
    Closed,
}

// ============================================================================
// Records
// ============================================================================

/// Ordered record headers. Later entries win on lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping earlier values with the same key.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace every value under `key` with a single value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Last value under `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Last value under `key`, if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A record delivered by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub headers: Headers,
    pub timestamp_ms: Option<i64>,
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub topic: String,
    /// `None` lets the broker pick (by key hash).
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub headers: Headers,
}

impl OutgoingRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            payload: Some(payload.into()),
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value);
        self
    }
}

/// Topic to create if absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub partitions: i32,
    /// `-1` defers to the broker default.
    pub replication_factor: i16,
}

// ============================================================================
// Traits
// ============================================================================

/// Publishes records.
///
/// Implementations are shared by every worker, so they must be safe for
/// concurrent use.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish one record and wait for the broker acknowledgement.
    async fn publish(&self, record: OutgoingRecord) -> Result<()>;
}

/// A single consumer-group member.
///
/// Owned by exactly one worker. At most one record per partition is handed
/// out until it is committed or rewound, which preserves partition order.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    /// Wait up to `timeout` for the next record.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>>;

    /// Acknowledge `record`: the group will not see it again.
    async fn commit(&mut self, record: &ConsumedRecord) -> Result<()>;

    /// Return `record` to the group so it is delivered again.
    fn rewind(&mut self, record: &ConsumedRecord) -> Result<()>;

    /// Stop fetching from every assigned partition.
    fn pause_all(&mut self) -> Result<()>;

    fn resume_all(&mut self) -> Result<()>;

    /// Zero-timeout poll that keeps the group membership alive while paused.
    ///
    /// A record returned despite the pause is rewound, never processed.
    fn keep_alive(&mut self) -> Result<()>;

    /// Leave the group, returning any uncommitted record.
    async fn close(&mut self);
}

/// Creates consumers, one per worker.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create(&self, group_id: &str, topics: &[String]) -> Result<Box<dyn RecordConsumer>>;
}

/// Idempotent topic creation.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Create each topic unless it already exists.
    async fn create_topics(&self, topics: &[NewTopic]) -> Result<()>;
}

/// The three transport seams, bundled.
#[derive(Clone)]
pub struct Transport {
    pub publisher: Arc<dyn RecordPublisher>,
    pub consumers: Arc<dyn ConsumerFactory>,
    pub admin: Arc<dyn TopicAdmin>,
}

impl Transport {
    /// Transport backed by an in-memory broker.
    pub fn in_memory(broker: InMemoryBroker) -> Self {
        Self {
            publisher: Arc::new(broker.clone()),
            consumers: Arc::new(broker.clone()),
            admin: Arc::new(broker),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker.
    #[default]
    Memory,
    /// Kafka messaging.
    Kafka,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Kafka-specific configuration.
    pub kafka: KafkaConfig,
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
    /// Session timeout for consumers.
    pub session_timeout_ms: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            session_timeout_ms: 45_000,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the transport based on configuration.
///
/// Kafka requires the `kafka` feature.
pub async fn init_transport(
    config: &MessagingConfig,
) -> std::result::Result<Transport, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Memory => {
            info!(messaging_type = "memory", "Transport initialized");
            Ok(Transport::in_memory(InMemoryBroker::new()))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let kafka_config = KafkaTransportConfig::from_config(&config.kafka);
                let transport = Transport {
                    publisher: Arc::new(KafkaPublisher::new(&kafka_config)?),
                    consumers: Arc::new(KafkaConsumerFactory::new(kafka_config.clone())),
                    admin: Arc::new(KafkaAdmin::new(&kafka_config)?),
                };
                info!(messaging_type = "kafka", "Transport initialized");
                Ok(transport)
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka".into())
            }
        }
    }
}
