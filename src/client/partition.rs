use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::broker::{BrokerError, Cluster, OffsetAt, Record};
use crate::client::stopped;
use crate::topic::TopicPartition;

/// A message handed to the caller of a group consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(tp: &TopicPartition, record: Record) -> Self {
        Self {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset: record.offset,
            key: record.key,
            value: record.value,
            timestamp: record.timestamp,
        }
    }
}

const NO_OFFSET: i64 = -1;

/// Offsets of one partition consumer, shared with the delivery path.
#[derive(Debug)]
pub struct PartitionOffsets {
    delivered: AtomicI64,
    committed: AtomicI64,
    stopped: AtomicBool,
}

impl PartitionOffsets {
    fn new(committed: Option<i64>) -> Self {
        let committed = committed.unwrap_or(NO_OFFSET);
        Self {
            delivered: AtomicI64::new(committed),
            committed: AtomicI64::new(committed),
            stopped: AtomicBool::new(false),
        }
    }

    fn get(value: &AtomicI64) -> Option<i64> {
        match value.load(Ordering::SeqCst) {
            NO_OFFSET => None,
            offset => Some(offset),
        }
    }

    /// Highest offset handed to the caller.
    pub fn delivered(&self) -> Option<i64> {
        Self::get(&self.delivered)
    }

    pub fn committed(&self) -> Option<i64> {
        Self::get(&self.committed)
    }

    /// Offset that is safe to commit and not committed yet.
    pub fn pending_commit(&self) -> Option<i64> {
        let delivered = self.delivered()?;
        match self.committed() {
            Some(committed) if committed >= delivered => None,
            _ => Some(delivered),
        }
    }

    pub(crate) fn mark_delivered(&self, offset: i64) {
        self.delivered.fetch_max(offset, Ordering::SeqCst);
    }

    pub(crate) fn mark_committed(&self, offset: i64) {
        self.committed.fetch_max(offset, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A fetched message on its way to the caller.
#[derive(Debug)]
pub(crate) struct Delivery {
    offsets: Arc<PartitionOffsets>,
    message: Message,
}

impl Delivery {
    /// Hands the message over, recording it as delivered. Messages of stopped
    /// consumers are dropped; whoever owns the partition next will fetch them again.
    pub(crate) fn accept(self) -> Option<Message> {
        if self.offsets.is_stopped() {
            return None;
        }

        self.offsets.mark_delivered(self.message.offset);
        Some(self.message)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FetchSettings {
    pub max_records: usize,
    pub max_wait: Duration,
    pub backoff: BackoffConfig,
}

/// Fetches one partition on its own task and forwards its messages, in log order, into
/// the group's output channel.
#[derive(Debug)]
pub(crate) struct PartitionConsumer {
    tp: TopicPartition,
    offsets: Arc<PartitionOffsets>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PartitionConsumer {
    /// Starts fetching at `start`. `committed` seeds the commit bookkeeping.
    pub(crate) fn start(
        cluster: Arc<dyn Cluster>,
        tp: TopicPartition,
        start: i64,
        committed: Option<i64>,
        settings: FetchSettings,
        output: mpsc::Sender<Delivery>,
        unreachable: mpsc::UnboundedSender<TopicPartition>,
    ) -> Self {
        let offsets = Arc::new(PartitionOffsets::new(committed));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let fetcher = Fetcher {
            cluster,
            tp: tp.clone(),
            next: start,
            settings,
            offsets: Arc::clone(&offsets),
            output,
            unreachable,
        };
        let handle = tokio::spawn(fetcher.run(shutdown_rx));

        Self {
            tp,
            offsets,
            shutdown,
            handle,
        }
    }

    pub(crate) fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub(crate) fn offsets(&self) -> &Arc<PartitionOffsets> {
        &self.offsets
    }

    /// Highest offset handed to the caller, the one that is safe to commit.
    pub(crate) fn safe_offset(&self) -> Option<i64> {
        self.offsets.delivered()
    }

    /// Whether the fetch loop exited on its own.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops fetching and waits for the task to exit. Returns the final offsets.
    pub(crate) async fn stop(self) -> Arc<PartitionOffsets> {
        self.offsets.stopped.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        if let Err(err) = self.handle.await {
            if err.is_panic() {
                error!(partition = %self.tp, %err, "partition consumer panicked");
            }
        }

        debug!(
            partition = %self.tp,
            safe_offset = ?self.offsets.delivered(),
            "partition consumer stopped",
        );

        self.offsets
    }
}

struct Fetcher {
    cluster: Arc<dyn Cluster>,
    tp: TopicPartition,
    next: i64,
    settings: FetchSettings,
    offsets: Arc<PartitionOffsets>,
    output: mpsc::Sender<Delivery>,
    unreachable: mpsc::UnboundedSender<TopicPartition>,
}

impl Fetcher {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(partition = %self.tp, start = self.next, "start consuming partition");

        let mut backoff = Backoff::new(&self.settings.backoff);

        loop {
            let result = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                result = self.cluster.fetch(
                    &self.tp.topic,
                    self.tp.partition,
                    self.next,
                    self.settings.max_records,
                    self.settings.max_wait,
                ) => result,
            };

            let err = match result {
                Ok(records) => {
                    backoff = Backoff::new(&self.settings.backoff);
                    if !self.forward(records, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(BrokerError::OffsetOutOfRange { .. }) => match self.reset_offset().await {
                    Ok(()) => continue,
                    Err(err) => err,
                },
                Err(err @ BrokerError::UnknownTopicOrPartition { .. }) => {
                    warn!(partition = %self.tp, %err, "partition unreachable");
                    if self.unreachable.send(self.tp.clone()).is_err() {
                        debug!(partition = %self.tp, "coordinator gone, unreachable partition not reported");
                    }
                    break;
                }
                Err(err) => err,
            };

            let wait = backoff
                .next()
                .unwrap_or(self.settings.backoff.max_backoff);
            warn!(
                partition = %self.tp,
                %err,
                backoff_secs = wait.as_secs_f64(),
                "fetch failed - backing off",
            );

            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!(partition = %self.tp, next = self.next, "fetch loop exited");
    }

    /// Sends records in order. Returns `false` once the consumer should stop.
    async fn forward(&mut self, records: Vec<Record>, shutdown: &mut watch::Receiver<bool>) -> bool {
        for record in records {
            // never go backwards, even if the broker hands out older records
            if record.offset < self.next {
                continue;
            }

            let offset = record.offset;
            let delivery = Delivery {
                offsets: Arc::clone(&self.offsets),
                message: Message::new(&self.tp, record),
            };

            tokio::select! {
                biased;
                _ = stopped(shutdown) => return false,
                sent = self.output.send(delivery) => {
                    if sent.is_err() {
                        // nobody is listening anymore
                        return false;
                    }
                }
            }

            self.next = offset + 1;
        }

        true
    }

    /// Moves `next` back into the retained part of the log.
    async fn reset_offset(&mut self) -> Result<(), BrokerError> {
        let earliest = self
            .cluster
            .offset_at(&self.tp.topic, self.tp.partition, OffsetAt::Earliest)
            .await?;
        let latest = self
            .cluster
            .offset_at(&self.tp.topic, self.tp.partition, OffsetAt::Latest)
            .await?;

        let next = self.next.clamp(earliest, latest.max(earliest));
        warn!(
            partition = %self.tp,
            requested = self.next,
            earliest,
            latest,
            next,
            "offset out of range, resetting",
        );
        self.next = next;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::broker::MemoryCluster;

    fn settings() -> FetchSettings {
        FetchSettings {
            max_records: 4,
            max_wait: Duration::from_millis(20),
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        }
    }

    fn cluster_with(records: i64) -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.create_topic("t", 1, &[]);
        for i in 0..records {
            cluster
                .produce("t", 0, None, Some(i.to_string().into_bytes()))
                .unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn delivers_in_order_from_start() {
        let cluster = cluster_with(10);
        let (tx, mut rx) = mpsc::channel(16);
        let (unreachable, _unreachable_rx) = mpsc::unbounded_channel();

        let consumer = PartitionConsumer::start(
            Arc::new(cluster),
            TopicPartition::new("t", 0),
            3,
            Some(2),
            settings(),
            tx,
            unreachable,
        );

        let mut offsets = vec![];
        for _ in 0..7 {
            let message = rx.recv().await.unwrap().accept().unwrap();
            offsets.push(message.offset);
        }
        assert_eq!(offsets, (3..10).collect::<Vec<_>>());

        let offsets = consumer.stop().await;
        assert_eq!(offsets.delivered(), Some(9));
        assert_eq!(offsets.committed(), Some(2));
        assert_eq!(offsets.pending_commit(), Some(9));
    }

    #[tokio::test]
    async fn commits_trail_delivery() {
        let cluster = cluster_with(5);
        let (tx, mut rx) = mpsc::channel(16);
        let (unreachable, _unreachable_rx) = mpsc::unbounded_channel();

        let consumer = PartitionConsumer::start(
            Arc::new(cluster),
            TopicPartition::new("t", 0),
            0,
            None,
            settings(),
            tx,
            unreachable,
        );

        // fetched but not handed over yet
        let first = rx.recv().await.unwrap();
        assert_eq!(consumer.offsets().pending_commit(), None);

        first.accept().unwrap();
        assert_eq!(consumer.safe_offset(), Some(0));
        assert_eq!(consumer.offsets().pending_commit(), Some(0));

        consumer.offsets().mark_committed(0);
        assert_eq!(consumer.offsets().pending_commit(), None);

        let offsets = consumer.stop().await;
        assert!(offsets.is_stopped());

        // buffered messages of a stopped consumer are dropped
        let buffered = rx.recv().await.unwrap();
        assert_matches!(buffered.accept(), None);
        assert_eq!(offsets.delivered(), Some(0));
    }

    #[tokio::test]
    async fn resets_when_log_was_truncated() {
        let cluster = cluster_with(10);
        cluster.truncate("t", 0, 7).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (unreachable, _unreachable_rx) = mpsc::unbounded_channel();

        let consumer = PartitionConsumer::start(
            Arc::new(cluster),
            TopicPartition::new("t", 0),
            2,
            Some(1),
            settings(),
            tx,
            unreachable,
        );

        let message = rx.recv().await.unwrap().accept().unwrap();
        assert_eq!(message.offset, 7);
        assert_eq!(message.value.as_deref(), Some(&b"7"[..]));

        consumer.stop().await;
    }

    #[tokio::test]
    async fn reports_unreachable_partition() {
        let cluster = cluster_with(0);
        let (tx, _rx) = mpsc::channel(16);
        let (unreachable, mut unreachable_rx) = mpsc::unbounded_channel();

        let consumer = PartitionConsumer::start(
            Arc::new(cluster.clone()),
            TopicPartition::new("t", 0),
            0,
            None,
            settings(),
            tx,
            unreachable,
        );

        cluster.delete_topic("t");

        assert_eq!(
            unreachable_rx.recv().await.unwrap(),
            TopicPartition::new("t", 0)
        );
        consumer.stop().await;
    }

    #[tokio::test]
    async fn finishes_when_nobody_takes_the_report() {
        let cluster = cluster_with(0);
        let (tx, _rx) = mpsc::channel(16);
        let (unreachable, unreachable_rx) = mpsc::unbounded_channel();
        drop(unreachable_rx);

        let consumer = PartitionConsumer::start(
            Arc::new(cluster.clone()),
            TopicPartition::new("t", 0),
            0,
            None,
            settings(),
            tx,
            unreachable,
        );

        cluster.delete_topic("t");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !consumer.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        consumer.stop().await;
    }

    #[tokio::test]
    async fn picks_up_new_records() {
        let cluster = cluster_with(0);
        let (tx, mut rx) = mpsc::channel(16);
        let (unreachable, _unreachable_rx) = mpsc::unbounded_channel();

        let consumer = PartitionConsumer::start(
            Arc::new(cluster.clone()),
            TopicPartition::new("t", 0),
            0,
            None,
            settings(),
            tx,
            unreachable,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.produce("t", 0, Some(b"k".to_vec()), None).unwrap();

        let message = rx.recv().await.unwrap().accept().unwrap();
        assert_eq!(message.offset, 0);
        assert_eq!(message.key.as_deref(), Some(&b"k"[..]));

        consumer.stop().await;
    }
}
