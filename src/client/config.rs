use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::client::error::{Error, Result};

/// DEFAULT_REBALANCE_ATTEMPTS is the number of passes one rebalance gets before it
/// is reported as failed.
pub const DEFAULT_REBALANCE_ATTEMPTS: usize = 4;

/// DEFAULT_REBALANCE_RETRY_DELAY is how long a member waits before starting over after
/// a rebalance ran out of attempts.
pub const DEFAULT_REBALANCE_RETRY_DELAY: Duration = Duration::from_secs(10);

pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_FETCH_BUFFER: usize = 256;

pub const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_millis(500);

pub const DEFAULT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// DEFAULT_STORE_PATIENCE is how long connection loss to the coordination store is
/// tolerated before the consumer fails.
pub const DEFAULT_STORE_PATIENCE: Duration = Duration::from_secs(10);

/// Where to start a partition that has no committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DefaultOffset {
    Oldest,
    #[default]
    Newest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceConfig {
    /// Passes per rebalance, the first one included.
    pub max_attempts: usize,

    /// Wait between two passes of the same rebalance.
    pub backoff: BackoffConfig,

    pub retry_delay: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_REBALANCE_ATTEMPTS,
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(2),
                base: 2.,
                deadline: None,
                max_attempts: None,
            },
            retry_delay: DEFAULT_REBALANCE_RETRY_DELAY,
        }
    }
}

/// Settings of a group consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub rebalance: RebalanceConfig,

    /// How often delivered offsets are written to the coordination store.
    pub commit_interval: Duration,

    pub default_offset: DefaultOffset,

    /// Records asked for per fetch, also the capacity of the message channel.
    pub fetch_buffer: usize,

    /// How long a fetch may wait for new records.
    pub fetch_max_wait: Duration,

    pub fetch_backoff: BackoffConfig,

    /// How often partition metadata is compared against the last rebalance.
    pub metadata_refresh_interval: Duration,

    pub store_patience: Duration,

    /// Prefix of every path in the coordination store.
    pub chroot: String,

    /// Fixed member id. A random one is generated if unset.
    pub member_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rebalance: RebalanceConfig::default(),
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            default_offset: DefaultOffset::default(),
            fetch_buffer: DEFAULT_FETCH_BUFFER,
            fetch_max_wait: DEFAULT_FETCH_MAX_WAIT,
            fetch_backoff: BackoffConfig::default(),
            metadata_refresh_interval: DEFAULT_METADATA_REFRESH_INTERVAL,
            store_patience: DEFAULT_STORE_PATIENCE,
            chroot: String::new(),
            member_id: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.rebalance.max_attempts == 0 {
            return invalid("rebalance.max_attempts must be at least 1");
        }
        if let Err(msg) = self.rebalance.backoff.validate() {
            return invalid(&format!("rebalance.backoff: {msg}"));
        }
        if let Err(msg) = self.fetch_backoff.validate() {
            return invalid(&format!("fetch_backoff: {msg}"));
        }
        if self.commit_interval.is_zero() {
            return invalid("commit_interval must not be zero");
        }
        if self.metadata_refresh_interval.is_zero() {
            return invalid("metadata_refresh_interval must not be zero");
        }
        if self.fetch_buffer == 0 {
            return invalid("fetch_buffer must not be zero");
        }
        if self.chroot.contains("//") || (!self.chroot.is_empty() && !self.chroot.starts_with('/')) {
            return invalid("chroot must be an absolute path");
        }
        if matches!(&self.member_id, Some(id) if id.is_empty() || id.contains('/')) {
            return invalid("member_id must be non-empty and must not contain '/'");
        }

        Ok(())
    }
}
