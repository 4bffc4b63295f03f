//! Group semantics on top of a [`KeyStore`].
//!
//! Layout, relative to an optional chroot:
//!
//! ```text
//! /<group>/members/<member id>          ephemeral, comma separated topic list
//! /<group>/owners/<topic>/<partition>   ephemeral, owning member id
//! /<group>/offsets/<topic>/<partition>  persistent, last committed offset
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, error, info, warn};

use super::{join_path, CreateMode, KeyStore, StoreError, Watch};
use crate::backoff::{Backoff, BackoffConfig};
use crate::client::error::{Error, Result};
use crate::topic::TopicPartition;

const CLAIM_TRIES: usize = 3;
const WATCH_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CoordinationStore {
    store: Arc<dyn KeyStore>,
    chroot: String,
    patience: BackoffConfig,
}

impl CoordinationStore {
    /// Transient connection errors are retried until `patience` has been spent
    /// backing off, after which calls fail with [`Error::StoreUnavailable`].
    pub fn new(store: Arc<dyn KeyStore>, chroot: impl Into<String>, patience: Duration) -> Self {
        let patience = BackoffConfig {
            init_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            base: 2.,
            deadline: Some(patience),
            max_attempts: None,
        };

        Self::with_backoff(store, chroot, patience)
    }

    pub fn with_backoff(
        store: Arc<dyn KeyStore>,
        chroot: impl Into<String>,
        patience: BackoffConfig,
    ) -> Self {
        let chroot = chroot.into().trim_end_matches('/').to_string();
        Self {
            store,
            chroot,
            patience,
        }
    }

    fn root_path(&self) -> String {
        if self.chroot.is_empty() {
            "/".to_string()
        } else {
            self.chroot.clone()
        }
    }

    pub fn group_path(&self, group: &str) -> String {
        join_path(&self.root_path(), group)
    }

    pub fn members_path(&self, group: &str) -> String {
        join_path(&self.group_path(group), "members")
    }

    pub fn member_path(&self, group: &str, member_id: &str) -> String {
        join_path(&self.members_path(group), member_id)
    }

    fn owners_path(&self, group: &str) -> String {
        join_path(&self.group_path(group), "owners")
    }

    pub fn owner_path(&self, group: &str, topic: &str, partition: i32) -> String {
        join_path(
            &join_path(&self.owners_path(group), topic),
            &partition.to_string(),
        )
    }

    fn offsets_path(&self, group: &str) -> String {
        join_path(&self.group_path(group), "offsets")
    }

    pub fn offset_path(&self, group: &str, topic: &str, partition: i32) -> String {
        join_path(
            &join_path(&self.offsets_path(group), topic),
            &partition.to_string(),
        )
    }

    /// Runs one store call, retrying connection loss within the configured patience.
    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: (Fn() -> Fut) + Send + Sync,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        Backoff::new(&self.patience)
            .retry_with_backoff(op, || async {
                match f().await {
                    Ok(v) => ControlFlow::Break(Ok(v)),
                    Err(err) if err.is_transient() => ControlFlow::Continue(err),
                    Err(err @ (StoreError::SessionExpired | StoreError::Closed)) => {
                        ControlFlow::Break(Err(Error::StoreUnavailable(err)))
                    }
                    Err(err) => ControlFlow::Break(Err(Error::Store(err))),
                }
            })
            .await
            .map_err(|err| {
                error!(%err, op, "coordination store unreachable");
                Error::StoreUnavailable(StoreError::ConnectionLoss)
            })?
    }

    /// Creates `path` and all its missing ancestors as persistent nodes.
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);

            match self
                .call("create", || {
                    self.store
                        .create(&current, vec![], CreateMode::Persistent)
                })
                .await
            {
                Ok(()) | Err(Error::Store(StoreError::NodeExists(_))) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Registers `member_id` as a live member of `group`.
    pub async fn register_member(
        &self,
        group: &str,
        member_id: &str,
        topics: &[String],
    ) -> Result<()> {
        let path = self.member_path(group, member_id);
        let data = topics.join(",").into_bytes();

        let result = async {
            self.ensure_path(&self.members_path(group)).await?;
            self.call("create", || {
                self.store
                    .create(&path, data.clone(), CreateMode::Ephemeral)
            })
            .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(group, member_id, "registered group member");
                Ok(())
            }
            Err(source) => Err(Error::Registration {
                group: group.to_string(),
                member_id: member_id.to_string(),
                source: Box::new(source),
            }),
        }
    }

    /// Live members of `group`, sorted.
    pub async fn members(&self, group: &str) -> Result<Vec<String>> {
        let path = self.members_path(group);
        match self.call("children", || self.store.children(&path)).await {
            Ok(mut members) => {
                members.sort();
                Ok(members)
            }
            Err(Error::Store(StoreError::NoNode(_))) => Ok(vec![]),
            Err(err) => Err(err),
        }
    }

    /// Topics a member subscribed with.
    pub async fn member_topics(&self, group: &str, member_id: &str) -> Result<Vec<String>> {
        let path = self.member_path(group, member_id);
        let (data, _stat) = self.call("get", || self.store.get(&path)).await?;

        Ok(String::from_utf8_lossy(&data)
            .split(',')
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    async fn arm_membership_watch(&self, group: &str) -> Result<(Vec<String>, Watch)> {
        let path = self.members_path(group);
        self.ensure_path(&path).await?;

        let (mut members, watch) = self
            .call("watch_children", || self.store.watch_children(&path))
            .await?;
        members.sort();

        Ok((members, watch))
    }

    /// Membership changes of `group`.
    ///
    /// The stream is lazy. Its first item is the sorted membership seen while arming
    /// the first watch; after that, every time the one-shot watch fires (or is lost
    /// because of a disconnect) it is re-armed and the current membership is yielded.
    /// After yielding a fatal error the stream ends.
    pub fn watch_membership(&self, group: &str) -> BoxStream<'static, Result<Vec<String>>> {
        enum State {
            Arm,
            Armed(Watch),
            Done,
        }

        let store = self.clone();
        let group = group.to_string();

        stream::unfold(State::Arm, move |mut state| {
            let store = store.clone();
            let group = group.clone();

            async move {
                loop {
                    state = match state {
                        State::Done => return None,
                        State::Arm => match store.arm_membership_watch(&group).await {
                            Ok((members, watch)) => {
                                return Some((Ok(members), State::Armed(watch)));
                            }
                            Err(err) if err.is_fatal() => return Some((Err(err), State::Done)),
                            Err(err) => {
                                warn!(%err, %group, "cannot arm membership watch, retrying");
                                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                                return Some((Err(err), State::Arm));
                            }
                        },
                        State::Armed(watch) => {
                            match watch.await {
                                Ok(event) => debug!(?event, %group, "membership watch fired"),
                                Err(_) => debug!(%group, "membership watch lost, re-arming"),
                            }
                            State::Arm
                        }
                    };
                }
            }
        })
        .boxed()
    }

    /// Claims `partition` of `topic` for `member_id`.
    ///
    /// Fails with [`Error::AlreadyOwned`] if another member holds it. Claiming a
    /// partition this member already holds succeeds.
    pub async fn claim_ownership(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        member_id: &str,
    ) -> Result<()> {
        let path = self.owner_path(group, topic, partition);
        self.ensure_path(&join_path(&self.owners_path(group), topic))
            .await?;

        let mut owner = String::new();
        for _ in 0..CLAIM_TRIES {
            match self
                .call("create", || {
                    self.store
                        .create(&path, member_id.as_bytes().to_vec(), CreateMode::Ephemeral)
                })
                .await
            {
                Ok(()) => {
                    debug!(group, topic, partition, member_id, "claimed partition");
                    return Ok(());
                }
                Err(Error::Store(StoreError::NodeExists(_))) => {}
                Err(err) => return Err(err),
            }

            match self.call("get", || self.store.get(&path)).await {
                Ok((data, _stat)) => {
                    owner = String::from_utf8_lossy(&data).into_owned();
                    if owner == member_id {
                        return Ok(());
                    }
                    break;
                }
                // released in between, try again
                Err(Error::Store(StoreError::NoNode(_))) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::AlreadyOwned {
            topic: topic.to_string(),
            partition,
            owner,
        })
    }

    /// Releases `partition` of `topic` if it is held by `member_id`; otherwise a no-op.
    pub async fn release_ownership(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        member_id: &str,
    ) -> Result<()> {
        let path = self.owner_path(group, topic, partition);

        let (data, stat) = match self.call("get", || self.store.get(&path)).await {
            Ok(v) => v,
            Err(Error::Store(StoreError::NoNode(_))) => return Ok(()),
            Err(err) => return Err(err),
        };

        if data != member_id.as_bytes() {
            debug!(
                group,
                topic,
                partition,
                member_id,
                owner = %String::from_utf8_lossy(&data),
                "not releasing partition held by another member",
            );
            return Ok(());
        }

        match self
            .call("delete", || self.store.delete(&path, Some(stat.version)))
            .await
        {
            Ok(()) => {
                debug!(group, topic, partition, member_id, "released partition");
                Ok(())
            }
            Err(Error::Store(StoreError::NoNode(_) | StoreError::BadVersion(_))) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Last committed offset of a partition, if any.
    pub async fn read_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>> {
        let path = self.offset_path(group, topic, partition);
        match self.call("get", || self.store.get(&path)).await {
            Ok((data, _stat)) => parse_offset(&path, &data).map(Some),
            Err(Error::Store(StoreError::NoNode(_))) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Stores `offset` unless the stored offset is already at or beyond it.
    ///
    /// Returns whether the stored value changed.
    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<bool> {
        let path = self.offset_path(group, topic, partition);
        let data = offset.to_string().into_bytes();

        loop {
            match self.call("get", || self.store.get(&path)).await {
                Ok((current, stat)) => {
                    let current = parse_offset(&path, &current)?;
                    if current >= offset {
                        debug!(topic, partition, offset, current, "skipping stale commit");
                        return Ok(false);
                    }

                    match self
                        .call("set", || {
                            self.store.set(&path, data.clone(), Some(stat.version))
                        })
                        .await
                    {
                        Ok(_stat) => return Ok(true),
                        Err(Error::Store(StoreError::BadVersion(_) | StoreError::NoNode(_))) => {
                            continue
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(Error::Store(StoreError::NoNode(_))) => {
                    self.ensure_path(&join_path(&self.offsets_path(group), topic))
                        .await?;

                    match self
                        .call("create", || {
                            self.store
                                .create(&path, data.clone(), CreateMode::Persistent)
                        })
                        .await
                    {
                        Ok(()) => return Ok(true),
                        Err(Error::Store(StoreError::NodeExists(_))) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Releases every partition in `owned` and removes the membership entry.
    pub async fn deregister(
        &self,
        group: &str,
        member_id: &str,
        owned: &[TopicPartition],
    ) -> Result<()> {
        for tp in owned {
            self.release_ownership(group, &tp.topic, tp.partition, member_id)
                .await?;
        }

        let path = self.member_path(group, member_id);
        match self.call("delete", || self.store.delete(&path, None)).await {
            Ok(()) | Err(Error::Store(StoreError::NoNode(_))) => {
                info!(group, member_id, "deregistered group member");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Ends the store session.
    pub async fn close(&self) -> Result<()> {
        match self.store.close().await {
            Ok(()) | Err(StoreError::Closed) => Ok(()),
            Err(err) => Err(Error::StoreUnavailable(err)),
        }
    }

    /// Deletes the whole subtree of `group`: members, owners and offsets.
    pub async fn delete_group(&self, group: &str) -> Result<()> {
        let root = self.group_path(group);
        let mut stack = vec![(root, false)];

        while let Some((path, expanded)) = stack.pop() {
            if expanded {
                match self.call("delete", || self.store.delete(&path, None)).await {
                    Ok(()) | Err(Error::Store(StoreError::NoNode(_))) => {}
                    // a child appeared in the meantime
                    Err(Error::Store(StoreError::NotEmpty(_))) => stack.push((path, false)),
                    Err(err) => return Err(err),
                }
                continue;
            }

            let children = match self.call("children", || self.store.children(&path)).await {
                Ok(children) => children,
                Err(Error::Store(StoreError::NoNode(_))) => continue,
                Err(err) => return Err(err),
            };

            let parent = path.clone();
            stack.push((path, true));
            stack.extend(
                children
                    .into_iter()
                    .map(|child| (join_path(&parent, &child), false)),
            );
        }

        info!(group, "deleted group");
        Ok(())
    }

    /// Groups with a node under the chroot.
    pub async fn groups(&self) -> Result<Vec<String>> {
        let root = self.root_path();
        match self.call("children", || self.store.children(&root)).await {
            Ok(mut groups) => {
                groups.sort();
                Ok(groups)
            }
            Err(Error::Store(StoreError::NoNode(_))) => Ok(vec![]),
            Err(err) => Err(err),
        }
    }

    /// `(topic, partition)` → data of every node under `base/<topic>/<partition>`.
    async fn partition_nodes(&self, base: &str) -> Result<BTreeMap<TopicPartition, Vec<u8>>> {
        let mut nodes = BTreeMap::new();

        let topics = match self.call("children", || self.store.children(base)).await {
            Ok(topics) => topics,
            Err(Error::Store(StoreError::NoNode(_))) => return Ok(nodes),
            Err(err) => return Err(err),
        };

        for topic in topics {
            let topic_path = join_path(base, &topic);
            let partitions = match self.call("children", || self.store.children(&topic_path)).await
            {
                Ok(partitions) => partitions,
                Err(Error::Store(StoreError::NoNode(_))) => continue,
                Err(err) => return Err(err),
            };

            for partition in partitions {
                let Ok(id) = partition.parse::<i32>() else {
                    warn!(%topic, %partition, "ignoring malformed partition node");
                    continue;
                };

                let path = join_path(&topic_path, &partition);
                match self.call("get", || self.store.get(&path)).await {
                    Ok((data, _stat)) => {
                        nodes.insert(TopicPartition::new(topic.clone(), id), data);
                    }
                    Err(Error::Store(StoreError::NoNode(_))) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(nodes)
    }

    /// Current owner of every claimed partition of `group`.
    pub async fn owners(&self, group: &str) -> Result<BTreeMap<TopicPartition, String>> {
        Ok(self
            .partition_nodes(&self.owners_path(group))
            .await?
            .into_iter()
            .map(|(tp, data)| (tp, String::from_utf8_lossy(&data).into_owned()))
            .collect())
    }

    /// Committed offset of every partition of `group` that has one.
    pub async fn offsets(&self, group: &str) -> Result<BTreeMap<TopicPartition, i64>> {
        let base = self.offsets_path(group);
        self.partition_nodes(&base)
            .await?
            .into_iter()
            .map(|(tp, data)| {
                let path = self.offset_path(group, &tp.topic, tp.partition);
                parse_offset(&path, &data).map(|offset| (tp, offset))
            })
            .collect()
    }
}

fn parse_offset(path: &str, data: &[u8]) -> Result<i64> {
    let text = String::from_utf8_lossy(data);
    text.trim().parse::<i64>().map_err(|_| Error::InvalidOffset {
        path: path.to_string(),
        data: text.into_owned(),
    })
}
