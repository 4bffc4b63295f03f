use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub mod assignment;
pub mod config;
pub mod consumer_group;
pub mod controller;
pub mod error;
pub mod notifier;
pub mod partition;

use crate::backoff::BackoffConfig;
use crate::broker::Cluster;
use crate::client::consumer_group::GroupConsumer;
use crate::client::notifier::{LogNotifier, Notifier};
use crate::coordination::KeyStore;
use config::{Config, DefaultOffset};
use error::Result;

/// Builder for [`GroupConsumer`].
pub struct ConsumerBuilder {
    store: Arc<dyn KeyStore>,
    cluster: Arc<dyn Cluster>,
    group: String,
    topics: Vec<String>,
    config: Config,
    notifier: Arc<dyn Notifier>,
}

impl ConsumerBuilder {
    /// Create a new [`ConsumerBuilder`] for `group`, subscribed to `topics`.
    ///
    /// The consumer takes over the store session: it is closed when the consumer is.
    pub fn new(
        store: Arc<dyn KeyStore>,
        cluster: Arc<dyn Cluster>,
        group: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            store,
            cluster,
            group: group.into(),
            topics,
            config: Config::default(),
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Replace the whole config.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use a fixed member id instead of a generated one.
    pub fn member_id(mut self, member_id: impl Into<String>) -> Self {
        self.config.member_id = Some(member_id.into());
        self
    }

    /// Sets where partitions without a committed offset start.
    pub fn default_offset(mut self, default_offset: DefaultOffset) -> Self {
        self.config.default_offset = default_offset;
        self
    }

    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.config.commit_interval = interval;
        self
    }

    /// Sets the number of passes per rebalance and the backoff between them.
    pub fn rebalance_attempts(mut self, max_attempts: usize, backoff: BackoffConfig) -> Self {
        self.config.rebalance.max_attempts = max_attempts;
        self.config.rebalance.backoff = backoff;
        self
    }

    pub fn rebalance_retry_delay(mut self, delay: Duration) -> Self {
        self.config.rebalance.retry_delay = delay;
        self
    }

    pub fn fetch_buffer(mut self, fetch_buffer: usize) -> Self {
        self.config.fetch_buffer = fetch_buffer;
        self
    }

    pub fn fetch_max_wait(mut self, max_wait: Duration) -> Self {
        self.config.fetch_max_wait = max_wait;
        self
    }

    pub fn metadata_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.metadata_refresh_interval = interval;
        self
    }

    /// Sets how long connection loss to the store is tolerated before the consumer fails.
    pub fn store_patience(mut self, patience: Duration) -> Self {
        self.config.store_patience = patience;
        self
    }

    pub fn chroot(mut self, chroot: impl Into<String>) -> Self {
        self.config.chroot = chroot.into();
        self
    }

    /// Register in the group and start consuming.
    ///
    /// Returns once the member is registered; the first rebalance runs in the
    /// background.
    pub async fn build(self) -> Result<GroupConsumer> {
        self.config.validate()?;
        if self.topics.is_empty() {
            return Err(error::Error::InvalidConfig(
                "at least one topic is required".to_string(),
            ));
        }

        GroupConsumer::start(
            self.store,
            self.cluster,
            self.group,
            self.topics,
            self.config,
            self.notifier,
        )
        .await
    }
}

impl std::fmt::Debug for ConsumerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBuilder")
            .field("group", &self.group)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Resolves once shutdown was requested or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
