//! Broker and metadata collaborator.
//!
//! The group machinery never talks to brokers directly; it asks a [`Cluster`] for
//! partition metadata and records. Connection handling and request retries are the
//! implementation's business.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::topic::Partition;

pub mod memory;

pub use memory::MemoryCluster;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Unknown topic or partition: {topic}/{partition:?}")]
    UnknownTopicOrPartition {
        topic: String,
        partition: Option<i32>,
    },

    #[error("Offset {offset} out of range for {topic}/{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Which end of a partition's log to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAt {
    /// Offset of the oldest record still retained.
    Earliest,

    /// Offset the next produced record will get.
    Latest,
}

/// One record of a partition's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Cluster: Debug + Send + Sync {
    /// Current partitions of `topic`, in any order.
    async fn partitions(&self, topic: &str) -> Result<Vec<Partition>, BrokerError>;

    async fn offset_at(
        &self,
        topic: &str,
        partition: i32,
        at: OffsetAt,
    ) -> Result<i64, BrokerError>;

    /// Records starting at `offset`, at most `max_records` of them.
    ///
    /// Waits up to `max_wait` for records to arrive and returns an empty batch if none
    /// did.
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<Record>, BrokerError>;
}
