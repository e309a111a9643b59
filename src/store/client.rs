//! The store client capability consumed by the session.
//!
//! Backends implement [`StoreConnector`] to open connections and
//! [`StoreClient`] for the raw node operations. All calls block on I/O and
//! must only be made from worker tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::store::error::StoreResult;
use crate::store::path::NodePath;

/// Kind of change reported by a fired watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    /// A node appeared at a watched path that did not exist.
    NodeCreated,
    /// The watched node was removed.
    NodeDeleted,
    /// The watched node's payload was replaced.
    NodeDataChanged,
    /// A child of the watched node was created or removed.
    NodeChildrenChanged,
}

impl WatchEventType {
    /// The name shown in toasts and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::NodeCreated => "NodeCreated",
            WatchEventType::NodeDeleted => "NodeDeleted",
            WatchEventType::NodeDataChanged => "NodeDataChanged",
            WatchEventType::NodeChildrenChanged => "NodeChildrenChanged",
        }
    }
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked at most once when a one-shot watch fires.
///
/// Runs on a thread owned by the store client; implementations must hand
/// the notification off rather than process it in place.
pub type WatchCallback = Arc<dyn Fn(&NodePath, WatchEventType) + Send + Sync>;

/// Node metadata as reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStat {
    /// Number of payload changes.
    pub version: i32,
    /// Number of child-list changes.
    pub cversion: i32,
    /// Number of ACL changes.
    pub aversion: i32,
    /// Creation time, milliseconds since the epoch.
    pub ctime: u64,
    /// Last modification time, milliseconds since the epoch.
    pub mtime: u64,
    /// Payload size in bytes.
    pub data_length: usize,
    pub num_children: usize,
    /// Session id owning an ephemeral node, 0 for persistent nodes.
    pub ephemeral_owner: u64,
}

impl NodeStat {
    /// Ephemeral nodes live only as long as their owning session.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }

    /// Render the stat as display attributes.
    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("version".to_string(), self.version.to_string()),
            ("cversion".to_string(), self.cversion.to_string()),
            ("aversion".to_string(), self.aversion.to_string()),
            ("ctime".to_string(), self.ctime.to_string()),
            ("mtime".to_string(), self.mtime.to_string()),
            ("dataLength".to_string(), self.data_length.to_string()),
            ("numChildren".to_string(), self.num_children.to_string()),
            ("ephemeralOwner".to_string(), self.ephemeral_owner.to_string()),
        ])
    }
}

/// One access-control entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    /// Authentication scheme, e.g. `world` or `digest`.
    pub scheme: String,
    /// Identity within the scheme.
    pub id: String,
    /// Permission letters, e.g. `"cdrwa"`.
    pub perms: String,
}

impl AclEntry {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>, perms: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
            perms: perms.into(),
        }
    }

    /// The open-to-everyone entry new nodes get by default.
    pub fn world_all() -> Self {
        Self::new("world", "anyone", "cdrwa")
    }

    /// The entry as `scheme`/`id`/`perms` pairs for the ACL viewer.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("scheme".to_string(), self.scheme.clone()),
            ("id".to_string(), self.id.clone()),
            ("perms".to_string(), self.perms.clone()),
        ])
    }
}

/// A live connection to a store.
pub trait StoreClient: Send + Sync {
    /// Child names of `path` in store order.
    fn get_children(&self, path: &NodePath) -> StoreResult<Vec<String>>;

    fn get_data(&self, path: &NodePath) -> StoreResult<Vec<u8>>;

    /// Replace the payload. `expected_version` of `None` matches any version.
    fn set_data(
        &self,
        path: &NodePath,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat>;

    fn create(&self, path: &NodePath, data: &[u8]) -> StoreResult<()>;

    /// Delete a node that has no children.
    fn delete(&self, path: &NodePath) -> StoreResult<()>;

    fn get_acl(&self, path: &NodePath) -> StoreResult<Vec<AclEntry>>;

    /// Metadata for `path`, or `None` if it does not exist.
    fn stat(&self, path: &NodePath) -> StoreResult<Option<NodeStat>>;

    /// Register a one-shot watch on `path`. The watch may be set on a node
    /// that does not exist yet, in which case its creation fires it.
    /// Returns the node's current metadata if it exists.
    fn register_watch(
        &self,
        path: &NodePath,
        callback: WatchCallback,
    ) -> StoreResult<Option<NodeStat>>;

    /// Close the connection. Outstanding watches are dropped.
    fn close(&self);
}

/// Opens connections from a key-value configuration.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn StoreClient>>;
}
