//! Kafka transport.
//!
//! Producer writes are acknowledged by all in-sync replicas before
//! `publish` returns. Each worker owns one consumer-group member with
//! auto-commit disabled: offsets are committed explicitly once a record has
//! been handled or forwarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic as KafkaNewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{
    BusError, ConsumedRecord, ConsumerFactory, Headers, KafkaConfig, NewTopic, OutgoingRecord,
    RecordConsumer, RecordPublisher, Result, TopicAdmin,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaTransportConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    pub session_timeout_ms: u32,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    pub ssl_ca_location: Option<String>,
}

impl KafkaTransportConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            session_timeout_ms: 45_000,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            session_timeout_ms: config.session_timeout_ms,
            sasl_username: config.sasl_username.clone(),
            sasl_password: config.sasl_password.clone(),
            sasl_mechanism: config.sasl_mechanism.clone(),
            security_protocol: config.security_protocol.clone(),
            ssl_ca_location: config.ssl_ca_location.clone(),
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub(crate) fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    pub(crate) fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("session.timeout.ms", self.session_timeout_ms.to_string());

        self.apply_security_config(&mut config);
        config
    }

    pub(crate) fn admin_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);

        self.apply_security_config(&mut config);
        config
    }

    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Publisher shared by every worker.
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaTransportConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(bootstrap_servers = %config.bootstrap_servers, "Kafka producer connected");
        Ok(Self { producer })
    }
}

fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers.iter().fold(OwnedHeaders::new(), |acc, (key, value)| {
        acc.insert(Header {
            key,
            value: Some(value),
        })
    })
}

#[async_trait]
impl RecordPublisher for KafkaPublisher {
    async fn publish(&self, record: OutgoingRecord) -> Result<()> {
        let mut outgoing = FutureRecord::<[u8], [u8]>::to(&record.topic)
            .headers(to_kafka_headers(&record.headers));
        if let Some(ref key) = record.key {
            outgoing = outgoing.key(key.as_ref());
        }
        if let Some(ref payload) = record.payload {
            outgoing = outgoing.payload(payload.as_ref());
        }
        if let Some(partition) = record.partition {
            outgoing = outgoing.partition(partition);
        }

        let (partition, offset) = self
            .producer
            .send(outgoing, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish to {}: {}", record.topic, e)))?;

        debug!(topic = %record.topic, partition, offset, "Published record to Kafka");
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Creates one group member per worker.
pub struct KafkaConsumerFactory {
    config: KafkaTransportConfig,
}

impl KafkaConsumerFactory {
    pub fn new(config: KafkaTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConsumerFactory for KafkaConsumerFactory {
    async fn create(&self, group_id: &str, topics: &[String]) -> Result<Box<dyn RecordConsumer>> {
        let consumer: BaseConsumer = self
            .config
            .consumer_config(group_id)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to topics: {}", e)))?;

        info!(group = %group_id, topics = ?topics, "Subscribed to Kafka topics");
        Ok(Box::new(KafkaConsumer {
            consumer: Arc::new(consumer),
            group_id: group_id.to_string(),
        }))
    }
}

/// One consumer-group member.
pub struct KafkaConsumer {
    consumer: Arc<BaseConsumer>,
    group_id: String,
}

fn to_consumed(message: &OwnedMessage) -> ConsumedRecord {
    let headers: Headers = message
        .headers()
        .map(|hs| {
            hs.iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice),
        headers,
        timestamp_ms: message.timestamp().to_millis(),
    }
}

impl KafkaConsumer {
    fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
            .map_err(|e| BusError::Consume(format!("Failed to seek {}-{}: {}", topic, partition, e)))
    }

    fn assignment(&self) -> Result<TopicPartitionList> {
        self.consumer
            .assignment()
            .map_err(|e| BusError::Consume(format!("Failed to read assignment: {}", e)))
    }
}

#[async_trait]
impl RecordConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>> {
        let consumer = Arc::clone(&self.consumer);
        let polled = tokio::task::spawn_blocking(move || {
            consumer
                .poll(timeout)
                .map(|r| r.map(|m| m.detach()))
        })
        .await
        .map_err(|e| BusError::Consume(format!("Poll task failed: {}", e)))?;

        match polled {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(to_consumed(&message))),
            Some(Err(KafkaError::PartitionEOF(_))) => Ok(None),
            Some(Err(e)) => Err(BusError::Consume(format!("Kafka consumer error: {}", e))),
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| BusError::Commit(e.to_string()))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BusError::Commit(format!("Commit task failed: {}", e)))?
            .map_err(|e| BusError::Commit(format!("Failed to commit offset: {}", e)))
    }

    fn rewind(&mut self, record: &ConsumedRecord) -> Result<()> {
        self.seek(&record.topic, record.partition, record.offset)
    }

    fn pause_all(&mut self) -> Result<()> {
        let assignment = self.assignment()?;
        self.consumer
            .pause(&assignment)
            .map_err(|e| BusError::Consume(format!("Failed to pause: {}", e)))
    }

    fn resume_all(&mut self) -> Result<()> {
        let assignment = self.assignment()?;
        self.consumer
            .resume(&assignment)
            .map_err(|e| BusError::Consume(format!("Failed to resume: {}", e)))
    }

    fn keep_alive(&mut self) -> Result<()> {
        // Partitions assigned by a rebalance during the wait are not paused.
        match self.consumer.poll(Duration::ZERO) {
            Some(Ok(message)) => {
                let (topic, partition, offset) =
                    (message.topic().to_string(), message.partition(), message.offset());
                drop(message);
                warn!(topic = %topic, partition, offset, "Record fetched while paused, rewinding");
                self.seek(&topic, partition, offset)?;
                let assignment = self.assignment()?;
                self.consumer
                    .pause(&assignment)
                    .map_err(|e| BusError::Consume(format!("Failed to pause: {}", e)))
            }
            Some(Err(e)) => {
                debug!(error = %e, "Keep-alive poll reported an error");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(group = %self.group_id, "Kafka consumer closed");
    }
}

// ============================================================================
// Admin
// ============================================================================

/// Idempotent topic creation through the admin API.
pub struct KafkaAdmin {
    client: AdminClient<DefaultClientContext>,
}

impl KafkaAdmin {
    pub fn new(config: &KafkaTransportConfig) -> Result<Self> {
        let client = config
            .admin_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka admin client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TopicAdmin for KafkaAdmin {
    async fn create_topics(&self, topics: &[NewTopic]) -> Result<()> {
        let requests: Vec<KafkaNewTopic<'_>> = topics
            .iter()
            .map(|t| {
                KafkaNewTopic::new(
                    &t.name,
                    t.partitions,
                    TopicReplication::Fixed(i32::from(t.replication_factor)),
                )
            })
            .collect();

        let results = self
            .client
            .create_topics(&requests, &AdminOptions::new())
            .await
            .map_err(|e| BusError::Admin(format!("Failed to create topics: {}", e)))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "Created topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BusError::Admin(format!(
                        "Failed to create topic {}: {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
