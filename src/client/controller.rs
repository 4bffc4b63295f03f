use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info};

use crate::client::error::{Error, Result};
use crate::coordination::{CoordinationStore, KeyStore, StoreError};
use crate::topic::TopicPartition;

/// A group as recorded in the coordination store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDescription {
    pub group: String,

    /// Live members and the topics they subscribed to.
    pub members: BTreeMap<String, Vec<String>>,

    /// Owner of every claimed partition.
    pub owners: BTreeMap<TopicPartition, String>,

    pub offsets: BTreeMap<TopicPartition, i64>,
}

/// Group administration that does not need to be a member.
#[derive(Debug)]
pub struct ControllerClient {
    store: CoordinationStore,
}

impl ControllerClient {
    pub fn new(store: Arc<dyn KeyStore>, chroot: impl Into<String>, patience: Duration) -> Self {
        Self {
            store: CoordinationStore::new(store, chroot, patience),
        }
    }

    /// Groups with any state in the store.
    pub async fn list_groups(&self) -> Result<Vec<String>> {
        self.store.groups().await
    }

    /// describe_group returns members, owners and offsets of `group`.
    pub async fn describe_group(&self, group: &str) -> Result<GroupDescription> {
        let member_ids = self.store.members(group).await?;

        let mut tasks = futures::stream::FuturesUnordered::new();
        for member_id in member_ids {
            let store = self.store.clone();

            tasks.push(async move {
                let topics = store.member_topics(group, &member_id).await;
                (member_id, topics)
            });
        }

        let mut members = BTreeMap::new();
        while let Some((member_id, result)) = tasks.next().await {
            match result {
                Ok(topics) => {
                    members.insert(member_id, topics);
                }
                // left while we were looking
                Err(Error::Store(StoreError::NoNode(_))) => {
                    debug!(group, %member_id, "member disappeared");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(GroupDescription {
            group: group.to_string(),
            members,
            owners: self.store.owners(group).await?,
            offsets: self.store.offsets(group).await?,
        })
    }

    /// Committed offsets of `group`.
    pub async fn group_offsets(&self, group: &str) -> Result<BTreeMap<TopicPartition, i64>> {
        self.store.offsets(group).await
    }

    /// Removes `group` and its committed offsets. Groups with live members are kept.
    pub async fn delete_group(&self, group: &str) -> Result<()> {
        let members = self.store.members(group).await?;
        if let Some(member) = members.first() {
            return Err(Error::Store(StoreError::NotEmpty(
                self.store.member_path(group, member),
            )));
        }

        self.store.delete_group(group).await?;
        info!(group, "group deleted by controller");
        Ok(())
    }

    /// Ends the store session.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}
