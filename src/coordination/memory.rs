//! In-process [`KeyStore`] with ZooKeeper-like semantics.
//!
//! One [`MemoryStore`] is the shared tree; every [`MemorySession`] obtained from
//! [`MemoryStore::connect`] behaves like a client session against it. Ephemeral nodes
//! belong to the session that created them and disappear when it is closed or
//! [expired](MemorySession::expire).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{join_path, parent_path, CreateMode, KeyStore, Stat, StoreError, Watch, WatchEvent};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<u64>,
}

impl Node {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Live,
    Expired,
    Closed,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<(u64, oneshot::Sender<WatchEvent>)>>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: vec![],
                version: 0,
                ephemeral_owner: None,
            },
        );

        Self {
            nodes,
            watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
        }
    }
}

impl Tree {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = join_path(path, "");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.watches.remove(path) {
            for (_session, tx) in watches {
                // receiver may be gone already
                let _ = tx.send(event.clone());
            }
        }
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        self.fire(
            path,
            WatchEvent::NodeDeleted {
                path: path.to_string(),
            },
        );
        if let Some(parent) = parent_path(path) {
            self.fire(
                parent,
                WatchEvent::ChildrenChanged {
                    path: parent.to_string(),
                },
            );
        }
    }

    fn drop_watches(&mut self, session: u64) {
        for watches in self.watches.values_mut() {
            watches.retain(|(owner, _)| *owner != session);
        }
        self.watches.retain(|_, watches| !watches.is_empty());
    }

    fn end_session(&mut self, session: u64, state: SessionState) {
        let ephemerals = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();

        for path in ephemerals {
            self.remove(&path);
        }

        self.drop_watches(session);
        self.sessions.insert(session, state);
    }
}

/// Shared in-memory tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against the tree.
    pub fn connect(&self) -> MemorySession {
        let id = {
            let mut tree = self.tree.lock();
            let id = tree.next_session;
            tree.next_session += 1;
            tree.sessions.insert(id, SessionState::Live);
            id
        };

        debug!(session = id, "memory store session opened");

        MemorySession {
            id,
            tree: Arc::clone(&self.tree),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether a node exists, regardless of any session.
    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Data of a node, regardless of any session.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().nodes.get(path).map(|n| n.data.clone())
    }
}

/// A client session on a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
    reachable: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate the server expiring this session, e.g. because the process died.
    pub fn expire(&self) {
        info!(session = self.id, "expiring memory store session");
        self.tree.lock().end_session(self.id, SessionState::Expired);
    }

    /// Simulate a network partition between this session and the store.
    ///
    /// While unreachable every call fails with [`StoreError::ConnectionLoss`] and the
    /// session's pending watches are dropped.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.tree.lock().drop_watches(self.id);
        }
    }

    fn check(&self, tree: &Tree) -> Result<(), StoreError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }

        match tree.sessions.get(&self.id) {
            Some(SessionState::Live) => Ok(()),
            Some(SessionState::Expired) => Err(StoreError::SessionExpired),
            Some(SessionState::Closed) | None => Err(StoreError::Closed),
        }
    }
}

#[async_trait]
impl KeyStore for MemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<(), StoreError> {
        let mut tree = self.tree.lock();
        self.check(&tree)?;

        if tree.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).ok_or_else(|| StoreError::NodeExists(path.to_string()))?;
        match tree.nodes.get(parent) {
            None => return Err(StoreError::NoNode(parent.to_string())),
            Some(node) if node.ephemeral_owner.is_some() => {
                // ephemeral nodes cannot have children
                return Err(StoreError::NoNode(parent.to_string()));
            }
            Some(_) => {}
        }

        let ephemeral_owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.id),
        };
        tree.nodes.insert(
            path.to_string(),
            Node {
                data,
                version: 0,
                ephemeral_owner,
            },
        );

        let parent = parent.to_string();
        tree.fire(
            &parent,
            WatchEvent::ChildrenChanged {
                path: parent.clone(),
            },
        );

        Ok(())
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreError> {
        let tree = self.tree.lock();
        self.check(&tree)?;

        tree.nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat()))
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> Result<Stat, StoreError> {
        let mut tree = self.tree.lock();
        self.check(&tree)?;

        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(version) = version {
            if node.version != version {
                return Err(StoreError::BadVersion(path.to_string()));
            }
        }

        node.data = data;
        node.version += 1;

        Ok(node.stat())
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), StoreError> {
        let mut tree = self.tree.lock();
        self.check(&tree)?;

        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(version) = version {
            if node.version != version {
                return Err(StoreError::BadVersion(path.to_string()));
            }
        }
        if !tree.children(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }

        tree.remove(path);

        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.tree.lock();
        self.check(&tree)?;

        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }

        Ok(tree.children(path))
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch), StoreError> {
        let mut tree = self.tree.lock();
        self.check(&tree)?;

        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }

        let children = tree.children(path);
        let (tx, rx) = oneshot::channel();
        tree.watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, tx));

        Ok((children, rx))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut tree = self.tree.lock();
        match tree.sessions.get(&self.id) {
            Some(SessionState::Live) => {
                debug!(session = self.id, "closing memory store session");
                tree.end_session(self.id, SessionState::Closed);
                Ok(())
            }
            Some(SessionState::Expired) => Err(StoreError::SessionExpired),
            Some(SessionState::Closed) | None => Ok(()),
        }
    }
}
