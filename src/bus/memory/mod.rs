//! In-process broker for standalone mode and tests.
//!
//! Models the parts of a partitioned log the dispatcher relies on: topics
//! with N partitions, per-group committed offsets, and at most one
//! outstanding record per (group, topic, partition). Publishing to a topic
//! that does not exist creates it with one partition.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    BusError, ConsumedRecord, ConsumerFactory, Headers, NewTopic, OutgoingRecord, RecordConsumer,
    RecordPublisher, Result, TopicAdmin,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    payload: Option<Bytes>,
    headers: Headers,
    timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Next offset to hand out.
    next: i64,
    committed: i64,
    in_flight: bool,
}

type CursorKey = (String, String, i32);

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    cursors: HashMap<CursorKey, Cursor>,
    created: Vec<NewTopic>,
}

impl BrokerState {
    fn partition_count(&self, topic: &str) -> i32 {
        self.topics
            .get(topic)
            .map(|p| i32::try_from(p.len()).unwrap_or(i32::MAX))
            .unwrap_or(0)
    }

    fn ensure_topic(&mut self, topic: &str, partitions: i32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, partitions, "Creating in-memory topic");
            (0..partitions.max(1)).map(|_| Vec::new()).collect()
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    failing_publishes: AtomicUsize,
    keep_alive_polls: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory broker. Cheap to clone; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with `partitions` partitions if absent.
    pub fn create_topic(&self, name: &str, partitions: i32) {
        self.shared.lock().ensure_topic(name, partitions);
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Number of keep-alive polls issued by all consumers.
    pub fn keep_alive_polls(&self) -> usize {
        self.shared.keep_alive_polls.load(Ordering::SeqCst)
    }

    /// Every record on `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        let state = self.shared.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, stored)| {
                    to_consumed(topic, partition as i32, offset as i64, stored)
                })
            })
            .collect()
    }

    /// Sorted names of every topic.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.lock().topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Topics requested through [`TopicAdmin`], in request order.
    pub fn created_topics(&self) -> Vec<NewTopic> {
        self.shared.lock().created.clone()
    }

    /// Committed offset (next offset to read) for a group's partition.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> i64 {
        self.shared
            .lock()
            .cursors
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .map(|c| c.committed)
            .unwrap_or(0)
    }
}

fn to_consumed(topic: &str, partition: i32, offset: i64, stored: &StoredRecord) -> ConsumedRecord {
    ConsumedRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        headers: stored.headers.clone(),
        timestamp_ms: Some(stored.timestamp_ms),
    }
}

fn partition_for_key(key: Option<&Bytes>, partitions: usize) -> usize {
    match key {
        Some(key) if partitions > 1 => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as usize
        }
        _ => 0,
    }
}

#[async_trait]
impl RecordPublisher for InMemoryBroker {
    async fn publish(&self, record: OutgoingRecord) -> Result<()> {
        let injected = self
            .shared
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Publish(format!(
                "injected failure publishing to {}",
                record.topic
            )));
        }

        {
            let mut state = self.shared.lock();
            let partitions = state.ensure_topic(&record.topic, 1);
            let count = partitions.len();
            let index = match record.partition {
                Some(p) if p >= 0 && (p as usize) < count => p as usize,
                Some(p) => {
                    return Err(BusError::Publish(format!(
                        "partition {} out of range for {} ({} partitions)",
                        p, record.topic, count
                    )))
                }
                None => partition_for_key(record.key.as_ref(), count),
            };
            partitions[index].push(StoredRecord {
                key: record.key,
                payload: record.payload,
                headers: record.headers,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            });
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn create_topics(&self, topics: &[NewTopic]) -> Result<()> {
        let mut state = self.shared.lock();
        for topic in topics {
            state.ensure_topic(&topic.name, topic.partitions);
            state.created.push(topic.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerFactory for InMemoryBroker {
    async fn create(&self, group_id: &str, topics: &[String]) -> Result<Box<dyn RecordConsumer>> {
        if topics.is_empty() {
            return Err(BusError::Subscribe(format!(
                "group {} subscribed to no topics",
                group_id
            )));
        }
        Ok(Box::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            group_id: group_id.to_string(),
            topics: topics.to_vec(),
            paused: false,
            in_flight: Vec::new(),
            rotation: 0,
        }))
    }
}

/// Consumer-group member over an [`InMemoryBroker`].
pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    topics: Vec<String>,
    paused: bool,
    in_flight: Vec<(String, i32)>,
    rotation: usize,
}

impl InMemoryConsumer {
    fn try_take(&mut self) -> Option<ConsumedRecord> {
        if self.paused {
            return None;
        }

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let candidates: Vec<(String, i32)> = self
            .topics
            .iter()
            .flat_map(|t| (0..state.partition_count(t)).map(move |p| (t.clone(), p)))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        self.rotation = self.rotation.wrapping_add(1);
        for i in 0..candidates.len() {
            let (topic, partition) = &candidates[(self.rotation + i) % candidates.len()];
            let log = &state.topics[topic][*partition as usize];
            let cursor = state
                .cursors
                .entry((self.group_id.clone(), topic.clone(), *partition))
                .or_default();
            if cursor.in_flight || cursor.next >= log.len() as i64 {
                continue;
            }

            let offset = cursor.next;
            cursor.next += 1;
            cursor.in_flight = true;
            self.in_flight.push((topic.clone(), *partition));
            return Some(to_consumed(topic, *partition, offset, &log[offset as usize]));
        }
        None
    }

    fn release(&mut self, topic: &str, partition: i32) {
        self.in_flight
            .retain(|(t, p)| !(t == topic && *p == partition));
    }
}

#[async_trait]
impl RecordConsumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            if let Some(record) = self.try_take() {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let cursor = state
                .cursors
                .entry((self.group_id.clone(), record.topic.clone(), record.partition))
                .or_default();
            cursor.committed = cursor.committed.max(record.offset + 1);
            cursor.next = cursor.next.max(record.offset + 1);
            cursor.in_flight = false;
        }
        self.release(&record.topic, record.partition);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn rewind(&mut self, record: &ConsumedRecord) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let cursor = state
                .cursors
                .entry((self.group_id.clone(), record.topic.clone(), record.partition))
                .or_default();
            cursor.next = record.offset.max(cursor.committed);
            cursor.in_flight = false;
        }
        self.release(&record.topic, record.partition);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn pause_all(&mut self) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn resume_all(&mut self) -> Result<()> {
        self.paused = false;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn keep_alive(&mut self) -> Result<()> {
        self.shared.keep_alive_polls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        {
            let mut state = self.shared.lock();
            for (topic, partition) in self.in_flight.drain(..) {
                if let Some(cursor) = state
                    .cursors
                    .get_mut(&(self.group_id.clone(), topic.clone(), partition))
                {
                    cursor.next = cursor.committed;
                    cursor.in_flight = false;
                    debug!(group = %self.group_id, topic = %topic, partition, "Returned in-flight record on close");
                }
            }
        }
        self.shared.notify.notify_waiters();
    }
}
