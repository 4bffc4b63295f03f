//! In-process [`Cluster`] holding topics as plain vectors of records.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use super::{BrokerError, Cluster, OffsetAt, Record};
use crate::topic::Partition;

const DEFAULT_LEADER: &str = "localhost:9092";

#[derive(Debug)]
struct Log {
    leader: String,
    /// Offset of `records[0]`.
    start: i64,
    records: Vec<Record>,
}

impl Log {
    fn new(leader: String) -> Self {
        Self {
            leader,
            start: 0,
            records: vec![],
        }
    }

    fn latest(&self) -> i64 {
        self.start + self.records.len() as i64
    }
}

#[derive(Debug, Default)]
struct Inner {
    topics: RwLock<BTreeMap<String, Vec<Log>>>,
    appended: Notify,
}

/// Topics and partitions kept in memory, shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn unknown(topic: &str, partition: Option<i32>) -> BrokerError {
        BrokerError::UnknownTopicOrPartition {
            topic: topic.to_string(),
            partition,
        }
    }

    /// Create `topic` with `partitions` partitions, led round-robin by `leaders`.
    pub fn create_topic(&self, topic: &str, partitions: i32, leaders: &[&str]) {
        let logs = (0..partitions)
            .map(|id| {
                let leader = match leaders.len() {
                    0 => DEFAULT_LEADER,
                    n => leaders[id as usize % n],
                };
                Log::new(leader.to_string())
            })
            .collect();

        info!(topic, partitions, "New topic");
        self.inner.topics.write().insert(topic.to_string(), logs);
    }

    /// Grow `topic` by `count` partitions.
    pub fn add_partitions(&self, topic: &str, count: i32) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.write();
        let logs = topics
            .get_mut(topic)
            .ok_or_else(|| Self::unknown(topic, None))?;

        let leader = logs
            .last()
            .map(|log| log.leader.clone())
            .unwrap_or_else(|| DEFAULT_LEADER.to_string());
        logs.extend((0..count).map(|_| Log::new(leader.clone())));

        info!(topic, partitions = logs.len(), "Topic update");
        Ok(())
    }

    pub fn delete_topic(&self, topic: &str) {
        if self.inner.topics.write().remove(topic).is_some() {
            info!(topic, "Topic deleted");
        }
    }

    /// Move leadership of a partition to another broker.
    pub fn set_leader(&self, topic: &str, partition: i32, leader: &str) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.write();
        let log = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
            .ok_or_else(|| Self::unknown(topic, Some(partition)))?;

        log.leader = leader.to_string();
        Ok(())
    }

    /// Append a record and return its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Result<i64, BrokerError> {
        let offset = {
            let mut topics = self.inner.topics.write();
            let log = topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
                .ok_or_else(|| Self::unknown(topic, Some(partition)))?;

            let offset = log.latest();
            log.records.push(Record {
                offset,
                key,
                value,
                timestamp: Utc::now(),
            });
            offset
        };

        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    /// Drop every record below `before`, the way retention would.
    pub fn truncate(&self, topic: &str, partition: i32, before: i64) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.write();
        let log = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
            .ok_or_else(|| Self::unknown(topic, Some(partition)))?;

        let dropped = (before - log.start).clamp(0, log.records.len() as i64);
        log.records.drain(..dropped as usize);
        log.start += dropped;

        Ok(())
    }

    fn read(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_records: usize,
    ) -> Result<Vec<Record>, BrokerError> {
        let topics = self.inner.topics.read();
        let log = topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .ok_or_else(|| Self::unknown(topic, Some(partition)))?;

        if offset < log.start || offset > log.latest() {
            return Err(BrokerError::OffsetOutOfRange {
                topic: topic.to_string(),
                partition,
                offset,
            });
        }

        let from = (offset - log.start) as usize;
        Ok(log
            .records
            .iter()
            .skip(from)
            .take(max_records)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, BrokerError> {
        let topics = self.inner.topics.read();
        let logs = topics
            .get(topic)
            .ok_or_else(|| Self::unknown(topic, None))?;

        Ok(logs
            .iter()
            .enumerate()
            .map(|(id, log)| Partition::new(log.leader.clone(), id as i32))
            .collect())
    }

    async fn offset_at(
        &self,
        topic: &str,
        partition: i32,
        at: OffsetAt,
    ) -> Result<i64, BrokerError> {
        let topics = self.inner.topics.read();
        let log = topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .ok_or_else(|| Self::unknown(topic, Some(partition)))?;

        Ok(match at {
            OffsetAt::Earliest => log.start,
            OffsetAt::Latest => log.latest(),
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + max_wait;

        loop {
            // register interest before looking, so an append in between is not missed
            let appended = self.inner.appended.notified();

            let records = self.read(topic, partition, offset, max_records)?;
            if !records.is_empty() {
                return Ok(records);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(vec![]);
            }
        }
    }
}
