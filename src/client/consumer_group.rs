//! A member of a consumer group.
//!
//! Members never talk to each other. Each one registers in the coordination store,
//! watches the member list and, whenever it changes, computes the round-robin plan on
//! its own and claims the partitions that fall to it. A partition is only claimed
//! once its previous owner released it (or lost it together with its session), so
//! no partition is consumed by two members at the same time.
//!
//! Delivery is at-least-once. The committed offset of a partition is the highest
//! offset handed to the caller; a new owner resumes right after it.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::FuturesUnordered;
use futures::{ready, Stream, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::broker::{BrokerError, Cluster, OffsetAt};
use crate::client::assignment::plan_for_member;
use crate::client::config::{Config, DefaultOffset};
use crate::client::error::{Error, Result};
use crate::client::notifier::Notifier;
use crate::client::partition::{
    Delivery, FetchSettings, Message, PartitionConsumer, PartitionOffsets,
};
use crate::client::stopped;
use crate::coordination::{CoordinationStore, KeyStore, StoreError};
use crate::topic::{Partition, Topic, TopicPartition};

/// Lifecycle of a [`GroupConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Registered,
    Rebalancing,
    Running,
    Closing,
    Closed,
    Failed,
}

/// Handle of a running group member.
///
/// Messages of all claimed partitions are merged into one stream; order is kept
/// within a partition only. Call [`close`](Self::close) to leave the group cleanly.
pub struct GroupConsumer {
    inner: Arc<Inner>,
    messages: mpsc::Receiver<Delivery>,
    tasks: Mutex<Option<Tasks>>,
}

impl GroupConsumer {
    pub(crate) async fn start(
        store: Arc<dyn KeyStore>,
        cluster: Arc<dyn Cluster>,
        group: String,
        mut topics: Vec<String>,
        config: Config,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        topics.sort();
        topics.dedup();

        let member_id = config
            .member_id
            .clone()
            .unwrap_or_else(|| format!("{group}-{}", Uuid::new_v4()));
        let store = CoordinationStore::new(store, config.chroot.clone(), config.store_patience);
        let (state, _) = watch::channel(State::Starting);

        if let Err(err) = store.register_member(&group, &member_id, &topics).await {
            if let Err(close_err) = store.close().await {
                debug!(%close_err, "cannot close store session");
            }
            return Err(err);
        }

        state.send_replace(State::Registered);

        let (shutdown, _) = watch::channel(false);
        let (claims, _) = watch::channel(BTreeSet::new());
        let (output, messages) = mpsc::channel(config.fetch_buffer);
        let (unreachable_tx, unreachable_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            group,
            member_id,
            topics,
            config,
            store,
            cluster,
            notifier,
            state,
            shutdown,
            claims,
            owned: Mutex::new(Owned {
                output: Some(output),
                ..Default::default()
            }),
            unreachable: unreachable_tx,
            failure: parking_lot::Mutex::new(None),
        });

        let tasks = Tasks {
            watch: tokio::spawn(
                Arc::clone(&inner).forward_membership(membership_tx, inner.shutdown.subscribe()),
            ),
            control: tokio::spawn(Arc::clone(&inner).control_loop(
                membership_rx,
                unreachable_rx,
                inner.shutdown.subscribe(),
            )),
            commit: tokio::spawn(Arc::clone(&inner).commit_loop(inner.shutdown.subscribe())),
        };

        Ok(Self {
            inner,
            messages,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// Partitions this member currently owns.
    pub fn claims(&self) -> BTreeSet<TopicPartition> {
        self.inner.claims.borrow().clone()
    }

    pub fn subscribe_claims(&self) -> watch::Receiver<BTreeSet<TopicPartition>> {
        self.inner.claims.subscribe()
    }

    /// Next message of any claimed partition.
    ///
    /// Returns `None` once the consumer was closed or failed and the buffered messages
    /// are drained.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let delivery = self.messages.recv().await?;
            if let Some(message) = delivery.accept() {
                return Some(message);
            }
        }
    }

    /// Leave the group: stop all partition consumers, commit their final offsets,
    /// release ownership, deregister and close the store session.
    ///
    /// Closing twice is a no-op. If the consumer failed, the first call returns the
    /// error that made it fail.
    pub async fn close(&self) -> Result<()> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };

        let inner = &self.inner;
        inner.transition(State::Closing);
        inner.shutdown.send_replace(true);
        tasks.join().await;

        let failure = inner.failure.lock().take();
        if let Some(err) = failure {
            if let Err(close_err) = inner.store.close().await {
                debug!(%close_err, "cannot close store session");
            }
            return Err(err);
        }

        let result = inner.teardown().await;
        inner.transition(State::Closed);
        result
    }
}

impl Stream for GroupConsumer {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match ready!(this.messages.poll_recv(cx)) {
                Some(delivery) => {
                    if let Some(message) = delivery.accept() {
                        return Poll::Ready(Some(message));
                    }
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for GroupConsumer {
    fn drop(&mut self) {
        // background tasks exit; ownership lapses with the store session
        self.inner.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for GroupConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConsumer")
            .field("group", &self.inner.group)
            .field("member_id", &self.inner.member_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Tasks {
    watch: JoinHandle<()>,
    control: JoinHandle<()>,
    commit: JoinHandle<()>,
}

impl Tasks {
    async fn join(self) {
        for (name, handle) in [
            ("watch", self.watch),
            ("control", self.control),
            ("commit", self.commit),
        ] {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(task = name, %err, "group consumer task panicked");
                }
            }
        }
    }
}

/// Partitions held by this member. Guarded by one lock, shared by rebalance passes,
/// periodic commits and shutdown.
#[derive(Default)]
struct Owned {
    claimed: BTreeSet<TopicPartition>,
    consumers: BTreeMap<TopicPartition, PartitionConsumer>,

    /// Partitions per topic as seen by the last pass.
    topology: BTreeMap<String, Vec<Partition>>,

    /// Gone once the consumer shuts down, which closes the message channel.
    output: Option<mpsc::Sender<Delivery>>,
}

struct Inner {
    group: String,
    member_id: String,
    topics: Vec<String>,
    config: Config,
    store: CoordinationStore,
    cluster: Arc<dyn Cluster>,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<State>,
    shutdown: watch::Sender<bool>,
    claims: watch::Sender<BTreeSet<TopicPartition>>,
    owned: Mutex<Owned>,
    unreachable: mpsc::UnboundedSender<TopicPartition>,
    failure: parking_lot::Mutex<Option<Error>>,
}

impl Inner {
    fn transition(&self, to: State) {
        self.state.send_if_modified(|current| {
            let allowed = match current {
                State::Closed | State::Failed => false,
                State::Closing => matches!(to, State::Closed | State::Failed),
                _ => true,
            };
            if !allowed || *current == to {
                return false;
            }

            debug!(group = %self.group, from = ?current, ?to, "state transition");
            *current = to;
            true
        });
    }

    fn publish_claims(&self, owned: &Owned) {
        self.claims.send_replace(owned.claimed.clone());
    }

    /// Moves to [`State::Failed`] and stops consuming. The first error is kept for
    /// [`GroupConsumer::close`].
    async fn fail(&self, err: Error) {
        error!(
            group = %self.group,
            member_id = %self.member_id,
            %err,
            "group consumer failed",
        );

        self.transition(State::Failed);
        self.shutdown.send_replace(true);

        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }

        let mut owned = self.owned.lock().await;
        owned.output = None;
        for (_, consumer) in std::mem::take(&mut owned.consumers) {
            consumer.stop().await;
        }
        owned.claimed.clear();
        self.publish_claims(&owned);
    }

    async fn forward_membership(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<Result<Vec<String>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = self.store.watch_membership(&self.group);

        loop {
            let event = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                event = events.next() => event,
            };

            match event {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }

        debug!(group = %self.group, "membership watch stopped");
    }

    async fn control_loop(
        self: Arc<Self>,
        mut membership: mpsc::UnboundedReceiver<Result<Vec<String>>>,
        mut unreachable: mpsc::UnboundedReceiver<TopicPartition>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.config.metadata_refresh_interval;
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut retry_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                event = membership.recv() => match event {
                    Some(Ok(members)) => {
                        debug!(group = %self.group, ?members, "group membership changed");
                    }
                    Some(Err(err)) if err.is_fatal() => {
                        self.fail(err).await;
                        return;
                    }
                    Some(Err(err)) => {
                        warn!(group = %self.group, %err, "membership watch error");
                        continue;
                    }
                    None => break,
                },
                Some(tp) = unreachable.recv() => {
                    info!(group = %self.group, partition = %tp, "partition unreachable");
                }
                _ = refresh.tick() => match self.topology_changed().await {
                    Ok(true) => info!(group = %self.group, "partition metadata changed"),
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(group = %self.group, %err, "cannot refresh partition metadata");
                        continue;
                    }
                },
                _ = retry_timer(retry_at) => {
                    debug!(group = %self.group, "retrying rebalance");
                }
            }
            retry_at = None;

            // whatever queued up meanwhile is covered by the pass about to run
            while let Ok(event) = membership.try_recv() {
                if let Err(err) = event {
                    if err.is_fatal() {
                        self.fail(err).await;
                        return;
                    }
                }
            }
            while unreachable.try_recv().is_ok() {}

            match self.rebalance(&mut shutdown).await {
                Ok(()) => {}
                Err(Error::Closed) => break,
                Err(err) if err.is_fatal() => {
                    self.fail(err).await;
                    return;
                }
                Err(_) => {
                    let delay = self.config.rebalance.retry_delay;
                    info!(
                        group = %self.group,
                        delay_secs = delay.as_secs_f64(),
                        "rebalance failed, starting over later",
                    );
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }

        debug!(group = %self.group, "control loop stopped");
    }

    async fn commit_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.commit_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.commit_all().await {
                self.fail(err).await;
                break;
            }
        }

        debug!(group = %self.group, "commit loop stopped");
    }

    /// Commits every partition with new deliveries. Only fatal errors are returned.
    async fn commit_all(&self) -> Result<()> {
        let owned = self.owned.lock().await;
        for consumer in owned.consumers.values() {
            self.commit_partition(consumer.topic_partition(), consumer.offsets())
                .await?;
        }

        Ok(())
    }

    async fn commit_partition(&self, tp: &TopicPartition, offsets: &PartitionOffsets) -> Result<()> {
        let Some(offset) = offsets.pending_commit() else {
            return Ok(());
        };

        match self
            .store
            .commit_offset(&self.group, &tp.topic, tp.partition, offset)
            .await
        {
            Ok(_) => {
                offsets.mark_committed(offset);
                debug!(group = %self.group, partition = %tp, offset, "committed offset");
                Ok(())
            }
            Err(source) => {
                let err = Error::Commit {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset,
                    source: Box::new(source),
                };
                self.notifier.commit_error(&err);

                if err.is_fatal() {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Stops a partition consumer and commits what it delivered.
    async fn stop_consumer(&self, consumer: PartitionConsumer) -> Result<()> {
        let tp = consumer.topic_partition().clone();
        let offsets = consumer.stop().await;
        self.commit_partition(&tp, &offsets).await
    }

    async fn fetch_topics(&self) -> Result<Vec<Topic>> {
        let mut topics = Vec::with_capacity(self.topics.len());

        for name in &self.topics {
            let partitions = match self.cluster.partitions(name).await {
                Ok(partitions) => partitions,
                Err(BrokerError::UnknownTopicOrPartition { .. }) => {
                    debug!(topic = %name, "topic does not exist");
                    vec![]
                }
                Err(err) => return Err(err.into()),
            };
            topics.push(Topic::new(name.clone(), partitions));
        }

        Ok(topics)
    }

    async fn topology_changed(&self) -> Result<bool> {
        let topics = self.fetch_topics().await?;
        let owned = self.owned.lock().await;

        Ok(topics
            .iter()
            .any(|topic| owned.topology.get(&topic.name) != Some(&topic.partitions)))
    }

    /// Runs passes until one succeeds or the attempts are used up.
    async fn rebalance(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.transition(State::Rebalancing);
        self.notifier.rebalance_start();
        info!(
            group = %self.group,
            member_id = %self.member_id,
            "rebalance started",
        );

        let max_attempts = self.config.rebalance.max_attempts;
        let mut backoff = Backoff::new(&self.config.rebalance.backoff);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = {
                let mut owned = self.owned.lock().await;
                let result = self.rebalance_pass(&mut owned, shutdown).await;
                self.publish_claims(&owned);
                result
            };

            let err = match result {
                Ok(()) => break,
                Err(err) if err.is_fatal() || matches!(err, Error::Closed) => return Err(err),
                Err(err) => err,
            };

            let wait = if attempt < max_attempts {
                backoff.next()
            } else {
                None
            };
            let Some(wait) = wait else {
                let err = Error::Rebalance {
                    attempts: attempt,
                    source: Box::new(err),
                };
                warn!(group = %self.group, %err, "rebalance failed");
                self.notifier.rebalance_error(&err);
                return Err(err);
            };

            info!(
                group = %self.group,
                attempt,
                %err,
                backoff_secs = wait.as_secs_f64(),
                "rebalance pass failed - backing off",
            );

            tokio::select! {
                biased;
                _ = stopped(shutdown) => return Err(Error::Closed),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.notifier.rebalance_ok();
        self.transition(State::Running);
        info!(
            group = %self.group,
            member_id = %self.member_id,
            partitions = self.claims.borrow().len(),
            "rebalance finished",
        );

        Ok(())
    }

    /// One pass: plan, release what is no longer ours, claim what is new and make
    /// sure every claimed partition has a running consumer.
    async fn rebalance_pass(&self, owned: &mut Owned, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let topics = self.fetch_topics().await?;
        owned.topology = topics
            .iter()
            .map(|topic| (topic.name.clone(), topic.partitions.clone()))
            .collect();

        let members = self.store.members(&self.group).await?;
        if members.is_empty() {
            return Err(Error::NoMembers(self.group.clone()));
        }
        if members.binary_search(&self.member_id).is_err() {
            return Err(Error::NotRegistered {
                group: self.group.clone(),
                member_id: self.member_id.clone(),
            });
        }

        let subscriptions = self.subscriptions(&members).await?;
        let wanted = plan_for_member(&self.member_id, &subscriptions, &topics)
            .into_iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .into_iter()
                    .map(move |partition| TopicPartition::new(topic.clone(), partition.id))
            })
            .collect::<BTreeSet<_>>();
        debug!(
            group = %self.group,
            members = members.len(),
            wanted = wanted.len(),
            "computed assignment",
        );

        let released = owned
            .claimed
            .difference(&wanted)
            .cloned()
            .collect::<Vec<_>>();
        for tp in released {
            if let Some(consumer) = owned.consumers.remove(&tp) {
                self.stop_consumer(consumer).await?;
            }

            self.store
                .release_ownership(&self.group, &tp.topic, tp.partition, &self.member_id)
                .await?;
            owned.claimed.remove(&tp);
            info!(group = %self.group, partition = %tp, "released partition");

            if *shutdown.borrow() {
                return Err(Error::Closed);
            }
        }

        let claims = wanted
            .difference(&owned.claimed)
            .cloned()
            .collect::<Vec<_>>();
        for tp in claims {
            self.store
                .claim_ownership(&self.group, &tp.topic, tp.partition, &self.member_id)
                .await?;
            info!(group = %self.group, partition = %tp, "claimed partition");
            owned.claimed.insert(tp);

            if *shutdown.borrow() {
                return Err(Error::Closed);
            }
        }

        let Some(output) = owned.output.clone() else {
            return Err(Error::Closed);
        };
        let idle = owned
            .claimed
            .iter()
            .filter(|tp| owned.consumers.get(*tp).map_or(true, |c| c.is_finished()))
            .cloned()
            .collect::<Vec<_>>();
        for tp in idle {
            if let Some(consumer) = owned.consumers.remove(&tp) {
                self.stop_consumer(consumer).await?;
            }

            let consumer = self.start_consumer(&tp, output.clone()).await?;
            owned.consumers.insert(tp, consumer);
        }

        Ok(())
    }

    /// Subscribed topics of every member in `members`.
    ///
    /// Members that left in the meantime are skipped.
    async fn subscriptions(&self, members: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut reads = members
            .iter()
            .filter(|member_id| **member_id != self.member_id)
            .map(|member_id| async move {
                let topics = self.store.member_topics(&self.group, member_id).await;
                (member_id, topics)
            })
            .collect::<FuturesUnordered<_>>();

        let mut subscriptions = BTreeMap::new();
        subscriptions.insert(
            self.member_id.clone(),
            self.topics.iter().cloned().collect::<BTreeSet<_>>(),
        );
        while let Some((member_id, result)) = reads.next().await {
            match result {
                Ok(topics) => {
                    subscriptions.insert(member_id.clone(), topics.into_iter().collect());
                }
                Err(Error::Store(StoreError::NoNode(_))) => {
                    debug!(group = %self.group, %member_id, "member left during rebalance");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(subscriptions)
    }

    async fn start_consumer(
        &self,
        tp: &TopicPartition,
        output: mpsc::Sender<Delivery>,
    ) -> Result<PartitionConsumer> {
        let committed = self
            .store
            .read_offset(&self.group, &tp.topic, tp.partition)
            .await?;

        let start = match committed {
            Some(offset) => offset + 1,
            None => {
                let at = match self.config.default_offset {
                    DefaultOffset::Oldest => OffsetAt::Earliest,
                    DefaultOffset::Newest => OffsetAt::Latest,
                };
                self.cluster.offset_at(&tp.topic, tp.partition, at).await?
            }
        };
        debug!(
            group = %self.group,
            partition = %tp,
            start,
            committed = ?committed,
            "starting partition consumer",
        );

        Ok(PartitionConsumer::start(
            Arc::clone(&self.cluster),
            tp.clone(),
            start,
            committed,
            FetchSettings {
                max_records: self.config.fetch_buffer,
                max_wait: self.config.fetch_max_wait,
                backoff: self.config.fetch_backoff.clone(),
            },
            output,
            self.unreachable.clone(),
        ))
    }

    /// Final commits, ownership release, deregistration and session close.
    async fn teardown(&self) -> Result<()> {
        let mut owned = self.owned.lock().await;
        owned.output = None;

        let mut result = Ok(());
        for (_, consumer) in std::mem::take(&mut owned.consumers) {
            if let Err(err) = self.stop_consumer(consumer).await {
                result = result.and(Err(err));
            }
        }

        let claimed = std::mem::take(&mut owned.claimed)
            .into_iter()
            .collect::<Vec<_>>();
        self.publish_claims(&owned);

        if let Err(err) = self
            .store
            .deregister(&self.group, &self.member_id, &claimed)
            .await
        {
            error!(group = %self.group, %err, "cannot deregister member");
            result = result.and(Err(err));
        }

        if let Err(err) = self.store.close().await {
            error!(group = %self.group, %err, "cannot close store session");
            result = result.and(Err(err));
        }

        info!(
            group = %self.group,
            member_id = %self.member_id,
            "left consumer group",
        );
        result
    }
}

/// Fires at `at`, never if there is nothing to retry.
async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
