//! The hierarchical, watchable key store a group coordinates through.
//!
//! [`KeyStore`] is the transport-level interface (a ZooKeeper-like tree of nodes with
//! persistent and session-bound ephemeral nodes, versioned writes and one-shot child
//! watches). [`CoordinationStore`] layers the group semantics on top of it: membership,
//! partition ownership and committed offsets.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod memory;
pub mod store;

pub use memory::{MemorySession, MemoryStore};
pub use store::CoordinationStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("version mismatch on node {0}")]
    BadVersion(String),

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("connection to coordination store lost")]
    ConnectionLoss,

    #[error("coordination store session expired")]
    SessionExpired,

    #[error("coordination store session closed")]
    Closed,
}

impl StoreError {
    /// Errors worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Node outlives the session that created it.
    Persistent,

    /// Node is deleted when the creating session ends.
    Ephemeral,
}

/// Node metadata returned by reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Incremented on every `set`; used for compare-and-set.
    pub version: i32,

    /// Session that owns an ephemeral node.
    pub ephemeral_owner: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A child was created or deleted under the watched path.
    ChildrenChanged { path: String },

    /// The watched node itself went away.
    NodeDeleted { path: String },
}

/// Fires at most once. A dropped sender means the watch was lost (disconnect or
/// session end) and must be re-armed.
pub type Watch = oneshot::Receiver<WatchEvent>;

#[async_trait]
pub trait KeyStore: Debug + Send + Sync {
    /// Create a node. The parent must exist.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreError>;

    /// Overwrite a node's data, optionally only if its version matches.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> Result<Stat, StoreError>;

    /// Delete a childless node, optionally only if its version matches.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), StoreError>;

    /// Names (not paths) of the node's children.
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Like [`children`](Self::children), and arms a one-shot watch on the child set.
    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch), StoreError>;

    /// End the session; its ephemeral nodes are removed.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Joins `parent` and `child` into a store path.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a store path, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}
