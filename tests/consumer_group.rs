
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::StreamExt;
use rskafka_cluster::broker::{BrokerError, Cluster, MemoryCluster, OffsetAt, Record};
use rskafka_cluster::client::controller::ControllerClient;
use rskafka_cluster::coordination::{
    CreateMode, KeyStore, MemorySession, MemoryStore, Stat, StoreError, Watch,
};
use rskafka_cluster::topic::{Partition, TopicPartition};
use rskafka_cluster::{BackoffConfig, ConsumerBuilder, DefaultOffset, GroupConsumer, State};
use tracing::info;

use crate::test_helpers::{eventually, maybe_start_logging, Event, RecordingNotifier};

const WAIT: Duration = Duration::from_secs(10);

fn builder(
    session: impl KeyStore + 'static,
    cluster: Arc<dyn Cluster>,
    topics: &[&str],
) -> ConsumerBuilder {
    ConsumerBuilder::new(
        Arc::new(session),
        cluster,
        "group",
        topics.iter().map(|t| t.to_string()).collect(),
    )
    .default_offset(DefaultOffset::Oldest)
    .commit_interval(Duration::from_millis(50))
    .fetch_max_wait(Duration::from_millis(20))
    .rebalance_attempts(
        4,
        BackoffConfig {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            base: 2.,
            deadline: None,
            max_attempts: None,
        },
    )
    .rebalance_retry_delay(Duration::from_millis(100))
    .metadata_refresh_interval(Duration::from_millis(50))
    .store_patience(Duration::from_millis(200))
}

fn controller(store: &MemoryStore) -> ControllerClient {
    ControllerClient::new(Arc::new(store.connect()), "", Duration::from_millis(200))
}

async fn wait_for_state(consumer: &GroupConsumer, state: State) {
    let mut states = consumer.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("consumer never reached {state:?}"))
        .unwrap();
}

async fn recv(consumer: &mut GroupConsumer) -> (i32, i64) {
    let message = tokio::time::timeout(WAIT, consumer.recv())
        .await
        .expect("message in time")
        .expect("consumer is open");
    (message.partition, message.offset)
}

fn produce(cluster: &MemoryCluster, topic: &str, partition: i32, count: usize) {
    for i in 0..count {
        cluster
            .produce(topic, partition, None, Some(format!("msg {i}").into_bytes()))
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn members_split_partitions_and_take_over() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 6, &["b1:9092", "b2:9092"]);

    let a = builder(store.connect(), Arc::new(cluster.clone()), &["t"])
        .member_id("a")
        .build()
        .await
        .unwrap();
    eventually("a to own everything", WAIT, || a.claims().len() == 6).await;

    let b_session = store.connect();
    let b = builder(b_session.clone(), Arc::new(cluster.clone()), &["t"])
        .member_id("b")
        .build()
        .await
        .unwrap();

    eventually("a and b to split", WAIT, || {
        a.claims().len() == 3 && b.claims().len() == 3
    })
    .await;
    assert!(a.claims().is_disjoint(&b.claims()));
    wait_for_state(&a, State::Running).await;
    wait_for_state(&b, State::Running).await;

    let owners = controller(&store)
        .describe_group("group")
        .await
        .unwrap()
        .owners;
    assert_eq!(owners.len(), 6);
    for (tp, owner) in &owners {
        let holder = if a.claims().contains(tp) { "a" } else { "b" };
        assert_eq!(owner, holder, "{tp}");
    }

    // b crashes: its ephemeral records vanish and a picks everything up
    info!("expiring b");
    b_session.expire();

    eventually("a to take over", WAIT, || a.claims().len() == 6).await;
    wait_for_state(&b, State::Failed).await;
    wait_for_state(&a, State::Running).await;
    assert!(b.claims().is_empty());

    assert_matches!(b.close().await, Err(err) if err.is_fatal());
    a.close().await.unwrap();
    assert!(controller(&store).describe_group("group").await.unwrap().owners.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn members_on_different_topics_cover_every_partition() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t1", 2, &[]);
    cluster.create_topic("t2", 2, &[]);

    let a = builder(store.connect(), Arc::new(cluster.clone()), &["t1"])
        .member_id("a")
        .build()
        .await
        .unwrap();
    let b = builder(store.connect(), Arc::new(cluster.clone()), &["t2"])
        .member_id("b")
        .build()
        .await
        .unwrap();

    eventually("each member to own its topic", WAIT, || {
        a.claims().len() == 2 && b.claims().len() == 2
    })
    .await;
    assert!(a.claims().iter().all(|tp| tp.topic == "t1"));
    assert!(b.claims().iter().all(|tp| tp.topic == "t2"));

    // c shares both topics with the others
    let c = builder(store.connect(), Arc::new(cluster.clone()), &["t1", "t2"])
        .member_id("c")
        .build()
        .await
        .unwrap();

    eventually("t1 and t2 to be shared with c", WAIT, || {
        a.claims().len() == 1 && b.claims().len() == 1 && c.claims().len() == 2
    })
    .await;
    wait_for_state(&a, State::Running).await;
    wait_for_state(&b, State::Running).await;
    wait_for_state(&c, State::Running).await;

    let owners = controller(&store)
        .describe_group("group")
        .await
        .unwrap()
        .owners;
    assert_eq!(owners.len(), 4, "orphaned partitions: {owners:?}");
    assert_eq!(owners[&TopicPartition::new("t1", 0)], "a");
    assert_eq!(owners[&TopicPartition::new("t1", 1)], "c");
    assert_eq!(owners[&TopicPartition::new("t2", 0)], "b");
    assert_eq!(owners[&TopicPartition::new("t2", 1)], "c");

    for consumer in [a, b, c] {
        consumer.close().await.unwrap();
    }
    assert!(controller(&store).describe_group("group").await.unwrap().owners.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_during_rebalance_leaves_nothing_behind() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 4, &[]);

    let session = SlowClaims {
        inner: store.connect(),
        delay: Duration::from_millis(200),
        started: Arc::new(AtomicUsize::new(0)),
    };
    let started = Arc::clone(&session.started);

    let consumer = builder(session, Arc::new(cluster), &["t"])
        .member_id("m")
        .build()
        .await
        .unwrap();

    eventually("a claim to be in flight", WAIT, || {
        started.load(Ordering::SeqCst) > 0
    })
    .await;
    assert_eq!(consumer.state(), State::Rebalancing);
    consumer.close().await.unwrap();

    // the pass stopped after the claim in flight
    assert!(started.load(Ordering::SeqCst) < 4);
    assert_eq!(consumer.state(), State::Closed);
    assert!(consumer.claims().is_empty());

    let observer = store.connect();
    assert!(observer.children("/group/owners/t").await.unwrap().is_empty());
    assert!(observer.children("/group/members").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clean_handoff_has_no_duplicates() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 2, &[]);
    produce(&cluster, "t", 0, 10);
    produce(&cluster, "t", 1, 10);

    let mut seen = BTreeSet::new();

    let mut a = builder(store.connect(), Arc::new(cluster.clone()), &["t"])
        .build()
        .await
        .unwrap();
    for _ in 0..8 {
        assert!(seen.insert(recv(&mut a).await));
    }
    a.close().await.unwrap();

    // close committed what a delivered
    let offsets = controller(&store).group_offsets("group").await.unwrap();
    for (tp, offset) in &offsets {
        let delivered = seen
            .iter()
            .filter(|(p, _)| *p == tp.partition)
            .map(|(_, o)| *o)
            .max();
        assert_eq!(Some(*offset), delivered, "{tp}");
    }

    let mut b = builder(store.connect(), Arc::new(cluster.clone()), &["t"])
        .build()
        .await
        .unwrap();
    for _ in 0..12 {
        let message = recv(&mut b).await;
        assert!(seen.insert(message), "{message:?} delivered twice");
    }

    let all = (0..2)
        .flat_map(|p| (0..10).map(move |o| (p, o)))
        .collect::<BTreeSet<_>>();
    assert_eq!(seen, all);

    // nothing left over
    assert!(
        tokio::time::timeout(Duration::from_millis(200), b.recv())
            .await
            .is_err()
    );
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_after_crash_resumes_after_commit() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 1, &[]);
    produce(&cluster, "t", 0, 10);

    let session = store.connect();
    let mut a = builder(session.clone(), Arc::new(cluster.clone()), &["t"])
        .build()
        .await
        .unwrap();

    // also exercise the stream interface
    let offsets = (&mut a)
        .take(5)
        .map(|message| message.offset)
        .collect::<Vec<_>>()
        .await;
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    let admin = controller(&store);
    let committed = BTreeMap::from([(TopicPartition::new("t", 0), 4)]);
    tokio::time::timeout(WAIT, async {
        while admin.group_offsets("group").await.unwrap() != committed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("periodic commit");

    session.expire();
    wait_for_state(&a, State::Failed).await;

    let mut b = builder(store.connect(), Arc::new(cluster.clone()), &["t"])
        .build()
        .await
        .unwrap();
    assert_eq!(recv(&mut b).await, (0, 5));

    b.close().await.unwrap();
    assert_matches!(a.close().await, Err(_));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partition_growth_triggers_rebalance() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 1, &[]);
    let notifier = RecordingNotifier::default();

    let mut consumer = builder(store.connect(), Arc::new(cluster.clone()), &["t"])
        .notifier(Arc::new(notifier.clone()))
        .build()
        .await
        .unwrap();
    wait_for_state(&consumer, State::Running).await;
    assert_eq!(
        notifier.events(),
        vec![Event::RebalanceStart, Event::RebalanceOk]
    );

    cluster.add_partitions("t", 2).unwrap();
    eventually("new partitions to be claimed", WAIT, || {
        consumer.claims().len() == 3
    })
    .await;
    wait_for_state(&consumer, State::Running).await;

    let events = notifier.events();
    assert_eq!(
        events,
        vec![
            Event::RebalanceStart,
            Event::RebalanceOk,
            Event::RebalanceStart,
            Event::RebalanceOk,
        ]
    );

    produce(&cluster, "t", 2, 1);
    assert_eq!(recv(&mut consumer).await, (2, 0));

    consumer.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rebalance_errors_are_reported_and_retried() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 2, &[]);
    let flaky = FlakyCluster {
        inner: cluster.clone(),
        down: Arc::new(AtomicBool::new(true)),
    };
    let notifier = RecordingNotifier::default();

    let consumer = builder(store.connect(), Arc::new(flaky.clone()), &["t"])
        .notifier(Arc::new(notifier.clone()))
        .build()
        .await
        .unwrap();

    eventually("a rebalance error", WAIT, || {
        notifier
            .events()
            .iter()
            .any(|e| matches!(e, Event::RebalanceError(_)))
    })
    .await;
    assert_eq!(consumer.state(), State::Rebalancing);
    assert!(consumer.claims().is_empty());

    flaky.down.store(false, Ordering::SeqCst);
    wait_for_state(&consumer, State::Running).await;
    assert_eq!(consumer.claims().len(), 2);

    let events = notifier.events();
    assert_eq!(events.first(), Some(&Event::RebalanceStart));
    assert_eq!(events.last(), Some(&Event::RebalanceOk));

    consumer.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_errors_are_reported() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 1, &[]);
    produce(&cluster, "t", 0, 3);
    let notifier = RecordingNotifier::default();

    // a record nobody can parse blocks every commit of this partition
    let vandal = store.connect();
    for path in ["/group", "/group/offsets", "/group/offsets/t", "/group/offsets/t/0"] {
        vandal
            .create(path, b"garbage".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
    }

    let mut consumer = builder(store.connect(), Arc::new(cluster.clone()), &["t"])
        .notifier(Arc::new(notifier.clone()))
        .build()
        .await
        .unwrap();

    // the broken record also breaks resuming, so the first passes fail
    eventually("a rebalance error", WAIT, || {
        notifier
            .events()
            .iter()
            .any(|e| matches!(e, Event::RebalanceError(_)))
    })
    .await;

    vandal
        .set("/group/offsets/t/0", b"-1".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(recv(&mut consumer).await, (0, 0));
    wait_for_state(&consumer, State::Running).await;

    vandal
        .set("/group/offsets/t/0", b"garbage".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(recv(&mut consumer).await, (0, 1));
    eventually("a commit error", WAIT, || {
        notifier
            .events()
            .iter()
            .any(|e| matches!(e, Event::CommitError(_)))
    })
    .await;

    // not fatal
    assert_eq!(consumer.state(), State::Running);
    assert_eq!(recv(&mut consumer).await, (0, 2));

    vandal.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    maybe_start_logging();

    let store = MemoryStore::new();
    let cluster = MemoryCluster::new();
    cluster.create_topic("t", 1, &[]);

    let consumer = builder(store.connect(), Arc::new(cluster), &["t"])
        .member_id("m")
        .build()
        .await
        .unwrap();
    wait_for_state(&consumer, State::Running).await;
    assert!(store.exists("/group/owners/t/0"));

    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert_eq!(consumer.state(), State::Closed);
    assert!(!store.exists("/group/members/m"));
    assert!(!store.exists("/group/owners/t/0"));
}

/// Metadata lookups fail while `down` is set.
#[derive(Debug, Clone)]
struct FlakyCluster {
    inner: MemoryCluster,
    down: Arc<AtomicBool>,
}

#[async_trait]
impl Cluster for FlakyCluster {
    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("metadata".to_string()));
        }
        self.inner.partitions(topic).await
    }

    async fn offset_at(
        &self,
        topic: &str,
        partition: i32,
        at: OffsetAt,
    ) -> Result<i64, BrokerError> {
        self.inner.offset_at(topic, partition, at).await
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        self.inner
            .fetch(topic, partition, offset, max_records, max_wait)
            .await
    }
}

/// Ownership claims take `delay` each.
#[derive(Debug)]
struct SlowClaims {
    inner: MemorySession,
    delay: Duration,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl KeyStore for SlowClaims {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<(), StoreError> {
        if path.starts_with("/group/owners/t/") {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
        }
        self.inner.create(path, data, mode).await
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreError> {
        self.inner.get(path).await
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> Result<Stat, StoreError> {
        self.inner.set(path, data, version).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), StoreError> {
        self.inner.delete(path, version).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.inner.children(path).await
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch), StoreError> {
        self.inner.watch_children(path).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}
