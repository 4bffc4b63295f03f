use thiserror::Error;

use crate::broker::BrokerError;
use crate::coordination::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot register member '{member_id}' in group '{group}': {source}")]
    Registration {
        group: String,
        member_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Partition {topic}/{partition} is already owned by '{owner}'")]
    AlreadyOwned {
        topic: String,
        partition: i32,
        owner: String,
    },

    #[error("Rebalance gave up after {attempts} attempts: {source}")]
    Rebalance {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Cannot commit offset {offset} for {topic}/{partition}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: Box<Error>,
    },

    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("No live members visible in group '{0}'")]
    NoMembers(String),

    #[error("Member '{member_id}' is not visible in group '{group}'")]
    NotRegistered { group: String, member_id: String },

    #[error("Invalid offset record at {path}: {data:?}")]
    InvalidOffset { path: String, data: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Consumer is closed")]
    Closed,
}

impl Error {
    /// Whether the coordinator has to give up because of this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::Registration { .. } => true,
            Self::Rebalance { source, .. } | Self::Commit { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
