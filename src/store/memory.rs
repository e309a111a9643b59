//! In-memory store backend.
//!
//! `MemoryStore` plays both roles: it is the connector handed to a
//! [`StoreSession`](crate::store::StoreSession), and it exposes direct
//! mutation methods so tests (and the demo) can act as an external writer.
//! Watches are one-shot and fire on the mutating thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::ConnectionConfig;
use crate::store::client::{
    AclEntry, NodeStat, StoreClient, StoreConnector, WatchCallback, WatchEventType,
};
use crate::store::error::{StoreError, StoreResult};
use crate::store::path::NodePath;

#[derive(Debug, Clone)]
struct MemoryNode {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    ctime: u64,
    mtime: u64,
    ephemeral_owner: u64,
    acl: Vec<AclEntry>,
}

impl MemoryNode {
    fn new(data: Vec<u8>, ephemeral_owner: u64) -> Self {
        let now = now_millis();
        Self {
            data,
            version: 0,
            cversion: 0,
            ctime: now,
            mtime: now,
            ephemeral_owner,
            acl: vec![AclEntry::world_all()],
        }
    }
}

struct Watch {
    conn: u64,
    callback: WatchCallback,
}

struct MemoryInner {
    nodes: Mutex<BTreeMap<NodePath, MemoryNode>>,
    watches: Mutex<HashMap<NodePath, Vec<Watch>>>,
    reachable: AtomicBool,
    required_auth: Mutex<Option<(String, String)>>,
    next_conn: AtomicU64,
    /// Calls that reached the store through a connection.
    calls: AtomicU64,
    /// Paths whose deletion is refused, for exercising failures.
    refuse_delete: Mutex<Vec<NodePath>>,
    /// Added latency for payload reads, for exercising late completions.
    read_delay: Mutex<Option<Duration>>,
}

/// A shared in-memory hierarchy.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// A store holding only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodePath::root(), MemoryNode::new(Vec::new(), 0));
        Self {
            inner: Arc::new(MemoryInner {
                nodes: Mutex::new(nodes),
                watches: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                required_auth: Mutex::new(None),
                next_conn: AtomicU64::new(1),
                calls: AtomicU64::new(0),
                refuse_delete: Mutex::new(Vec::new()),
                read_delay: Mutex::new(None),
            }),
        }
    }

    /// Build a store from `(path, data)` pairs; missing parents are created.
    pub fn with_nodes<'a>(nodes: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> StoreResult<Self> {
        let store = Self::new();
        for (path, data) in nodes {
            store.create_all(&NodePath::new(path)?, data)?;
        }
        Ok(store)
    }

    /// Simulate the endpoint going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Require connections to present these credentials.
    pub fn require_auth(&self, scheme: &str, data: &str) {
        *lock(&self.inner.required_auth) = Some((scheme.to_string(), data.to_string()));
    }

    /// Make deletes of `path` fail with `OperationFailed`.
    pub fn refuse_delete(&self, path: &NodePath) {
        lock(&self.inner.refuse_delete).push(path.clone());
    }

    /// Make every `get_data` call take at least `delay`.
    pub fn delay_data_reads(&self, delay: Duration) {
        *lock(&self.inner.read_delay) = Some(delay);
    }

    /// Number of operations that went through a connection.
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Number of watches currently armed on `path`.
    pub fn armed_watches(&self, path: &NodePath) -> usize {
        lock(&self.inner.watches).get(path).map_or(0, Vec::len)
    }

    pub fn contains(&self, path: &NodePath) -> bool {
        lock(&self.inner.nodes).contains_key(path)
    }

    /// Create `path` and any missing ancestors, as an external writer.
    pub fn create_all(&self, path: &NodePath, data: &[u8]) -> StoreResult<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(path.clone());
        while let Some(p) = cursor {
            if self.contains(&p) {
                break;
            }
            cursor = p.parent();
            missing.push(p);
        }
        for p in missing.into_iter().rev() {
            let payload: &[u8] = if &p == path { data } else { &[] };
            self.inner.create(&p, payload, 0)?;
        }
        Ok(())
    }

    /// Create an ephemeral node owned by `owner`.
    pub fn create_ephemeral(&self, path: &NodePath, owner: u64) -> StoreResult<()> {
        self.inner.create(path, &[], owner)
    }

    /// Overwrite a node's payload, as an external writer.
    pub fn set(&self, path: &NodePath, data: &[u8]) -> StoreResult<NodeStat> {
        self.inner.set_data(path, data, None)
    }

    /// Delete a leaf node, as an external writer.
    pub fn remove(&self, path: &NodePath) -> StoreResult<()> {
        self.inner.delete(path)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn StoreClient>> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::RemoteUnavailable(format!(
                "{} unreachable",
                config.hosts().unwrap_or("memory")
            )));
        }
        if let Some((scheme, data)) = lock(&self.inner.required_auth).clone() {
            if config.auth() != Some((scheme.as_str(), data.as_str())) {
                return Err(StoreError::OperationFailed(
                    "authentication rejected".to_string(),
                ));
            }
        }
        let id = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Opened in-memory connection {}", id);
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

impl MemoryInner {
    fn stat_of(nodes: &BTreeMap<NodePath, MemoryNode>, path: &NodePath) -> Option<NodeStat> {
        let node = nodes.get(path)?;
        Some(NodeStat {
            version: node.version,
            cversion: node.cversion,
            aversion: 0,
            ctime: node.ctime,
            mtime: node.mtime,
            data_length: node.data.len(),
            num_children: Self::children_of(nodes, path).len(),
            ephemeral_owner: node.ephemeral_owner,
        })
    }

    fn children_of(nodes: &BTreeMap<NodePath, MemoryNode>, path: &NodePath) -> Vec<String> {
        nodes
            .keys()
            .filter(|p| p.parent().as_ref() == Some(path))
            .map(|p| p.name().to_string())
            .collect()
    }

    fn create(&self, path: &NodePath, data: &[u8], ephemeral_owner: u64) -> StoreResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::OperationFailed("root already exists".to_string()))?;
        {
            let mut nodes = lock(&self.nodes);
            if nodes.contains_key(path) {
                return Err(StoreError::OperationFailed(format!("{path} already exists")));
            }
            let parent_node = nodes
                .get_mut(&parent)
                .ok_or_else(|| StoreError::NodeNotFound(parent.to_string()))?;
            if parent_node.ephemeral_owner != 0 {
                return Err(StoreError::OperationFailed(format!(
                    "ephemeral node {parent} cannot have children"
                )));
            }
            parent_node.cversion += 1;
            nodes.insert(path.clone(), MemoryNode::new(data.to_vec(), ephemeral_owner));
        }
        self.fire(path, WatchEventType::NodeCreated);
        self.fire(&parent, WatchEventType::NodeChildrenChanged);
        Ok(())
    }

    fn set_data(
        &self,
        path: &NodePath,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        let stat = {
            let mut nodes = lock(&self.nodes);
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NodeNotFound(path.to_string()))?;
            if let Some(expected) = expected_version {
                if expected != node.version {
                    return Err(StoreError::OperationFailed(format!(
                        "version mismatch on {path}: expected {expected}, found {}",
                        node.version
                    )));
                }
            }
            node.data = data.to_vec();
            node.version += 1;
            node.mtime = now_millis();
            Self::stat_of(&nodes, path).unwrap_or_default()
        };
        self.fire(path, WatchEventType::NodeDataChanged);
        Ok(stat)
    }

    fn delete(&self, path: &NodePath) -> StoreResult<()> {
        if path.is_root() {
            return Err(StoreError::OperationFailed("cannot delete the root".to_string()));
        }
        if lock(&self.refuse_delete).contains(path) {
            return Err(StoreError::OperationFailed(format!("delete of {path} refused")));
        }
        {
            let mut nodes = lock(&self.nodes);
            if !nodes.contains_key(path) {
                return Err(StoreError::NodeNotFound(path.to_string()));
            }
            if !Self::children_of(&nodes, path).is_empty() {
                return Err(StoreError::OperationFailed(format!("{path} has children")));
            }
            nodes.remove(path);
            if let Some(parent) = path.parent().and_then(|p| nodes.get_mut(&p)) {
                parent.cversion += 1;
            }
        }
        self.fire(path, WatchEventType::NodeDeleted);
        if let Some(parent) = path.parent() {
            self.fire(&parent, WatchEventType::NodeChildrenChanged);
        }
        Ok(())
    }

    /// Fire and consume every watch armed on `path`.
    fn fire(&self, path: &NodePath, event: WatchEventType) {
        let fired = lock(&self.watches).remove(path).unwrap_or_default();
        for watch in fired {
            (watch.callback)(path, event);
        }
    }
}

struct MemoryConnection {
    inner: Arc<MemoryInner>,
    id: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn enter(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::RemoteUnavailable("connection closed".to_string()));
        }
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::RemoteUnavailable("store unreachable".to_string()));
        }
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl StoreClient for MemoryConnection {
    fn get_children(&self, path: &NodePath) -> StoreResult<Vec<String>> {
        self.enter()?;
        let nodes = lock(&self.inner.nodes);
        if !nodes.contains_key(path) {
            return Err(StoreError::NodeNotFound(path.to_string()));
        }
        Ok(MemoryInner::children_of(&nodes, path))
    }

    fn get_data(&self, path: &NodePath) -> StoreResult<Vec<u8>> {
        self.enter()?;
        let delay = *lock(&self.inner.read_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        lock(&self.inner.nodes)
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| StoreError::NodeNotFound(path.to_string()))
    }

    fn set_data(
        &self,
        path: &NodePath,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        self.enter()?;
        self.inner.set_data(path, data, expected_version)
    }

    fn create(&self, path: &NodePath, data: &[u8]) -> StoreResult<()> {
        self.enter()?;
        self.inner.create(path, data, 0)
    }

    fn delete(&self, path: &NodePath) -> StoreResult<()> {
        self.enter()?;
        self.inner.delete(path)
    }

    fn get_acl(&self, path: &NodePath) -> StoreResult<Vec<AclEntry>> {
        self.enter()?;
        lock(&self.inner.nodes)
            .get(path)
            .map(|n| n.acl.clone())
            .ok_or_else(|| StoreError::NodeNotFound(path.to_string()))
    }

    fn stat(&self, path: &NodePath) -> StoreResult<Option<NodeStat>> {
        self.enter()?;
        Ok(MemoryInner::stat_of(&lock(&self.inner.nodes), path))
    }

    fn register_watch(
        &self,
        path: &NodePath,
        callback: WatchCallback,
    ) -> StoreResult<Option<NodeStat>> {
        self.enter()?;
        let stat = MemoryInner::stat_of(&lock(&self.inner.nodes), path);
        lock(&self.inner.watches)
            .entry(path.clone())
            .or_default()
            .push(Watch {
                conn: self.id,
                callback,
            });
        Ok(stat)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut watches = lock(&self.inner.watches);
        for list in watches.values_mut() {
            list.retain(|w| w.conn != self.id);
        }
        watches.retain(|_, list| !list.is_empty());
        tracing::debug!("Closed in-memory connection {}", self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
