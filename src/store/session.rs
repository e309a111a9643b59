//! Connection lifecycle and raw node operations.
//!
//! `StoreSession` is the only owner of the live client handle. Every call
//! blocks on the store and must run on a worker task. Calls made while
//! disconnected fail with [`StoreError::NotConnected`] without touching the
//! store; there is no automatic reconnect.

use std::sync::{Arc, RwLock};

use crate::config::ConnectionConfig;
use crate::store::client::{AclEntry, NodeStat, StoreClient, StoreConnector, WatchCallback};
use crate::store::error::{StoreError, StoreResult};
use crate::store::path::NodePath;

/// The single connection to the store shared by every component.
///
/// Reconnecting swaps the client handle under a write lock, so callers
/// observe either the old session or the new one.
pub struct StoreSession {
    connector: Arc<dyn StoreConnector>,
    client: RwLock<Option<Arc<dyn StoreClient>>>,
}

impl StoreSession {
    /// Create a disconnected session that opens clients via `connector`.
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            client: RwLock::new(None),
        }
    }

    /// Open a connection. On failure any previous session is left as it was.
    pub fn connect(&self, config: &ConnectionConfig) -> StoreResult<()> {
        let client = self.connector.connect(config).map_err(|e| {
            tracing::warn!("Connect to {:?} failed: {}", config.hosts(), e);
            e
        })?;
        let previous = self
            .client
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .replace(client);
        if let Some(previous) = previous {
            previous.close();
        }
        tracing::info!("Connected to {}", config.hosts().unwrap_or("store"));
        Ok(())
    }

    /// Close the connection. Calling this while disconnected is a no-op.
    pub fn disconnect(&self) -> StoreResult<()> {
        let previous = self
            .client
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(client) = previous {
            client.close();
            tracing::info!("Disconnected from store");
        }
        Ok(())
    }

    /// Whether a client handle is currently held. Never touches the store.
    pub fn is_connected(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    fn client(&self) -> StoreResult<Arc<dyn StoreClient>> {
        self.client
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(StoreError::NotConnected)
    }

    /// Child names of `path` in store order.
    pub fn get_children(&self, path: &NodePath) -> StoreResult<Vec<String>> {
        self.client()?.get_children(path)
    }

    pub fn get_data(&self, path: &NodePath) -> StoreResult<Vec<u8>> {
        self.client()?.get_data(path)
    }

    pub fn set_data(&self, path: &NodePath, data: &[u8]) -> StoreResult<NodeStat> {
        self.client()?.set_data(path, data, None)
    }

    /// Conditional write; fails with `OperationFailed` on a version mismatch.
    pub fn set_data_if_version(
        &self,
        path: &NodePath,
        data: &[u8],
        version: i32,
    ) -> StoreResult<NodeStat> {
        self.client()?.set_data(path, data, Some(version))
    }

    /// Create `name` under `parent` with an empty payload.
    pub fn create_node(&self, parent: &NodePath, name: &str) -> StoreResult<NodePath> {
        let path = parent.child(name)?;
        self.client()?.create(&path, &[])?;
        Ok(path)
    }

    /// Delete `path` together with all of its descendants, children first.
    /// A node that is already gone counts as deleted.
    pub fn delete_node(&self, path: &NodePath) -> StoreResult<()> {
        let client = self.client()?;
        Self::delete_tree(client.as_ref(), path)
    }

    fn delete_tree(client: &dyn StoreClient, path: &NodePath) -> StoreResult<()> {
        let children = match client.get_children(path) {
            Ok(children) => children,
            Err(StoreError::NodeNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            Self::delete_tree(client, &path.child(&child)?)?;
        }
        match client.delete(path) {
            Err(StoreError::NodeNotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub fn get_acl(&self, path: &NodePath) -> StoreResult<Vec<AclEntry>> {
        self.client()?.get_acl(path)
    }

    pub fn exists(&self, path: &NodePath) -> StoreResult<bool> {
        Ok(self.client()?.stat(path)?.is_some())
    }

    pub fn stat(&self, path: &NodePath) -> StoreResult<Option<NodeStat>> {
        self.client()?.stat(path)
    }

    pub fn register_watch(
        &self,
        path: &NodePath,
        callback: WatchCallback,
    ) -> StoreResult<Option<NodeStat>> {
        self.client()?.register_watch(path, callback)
    }
}
