//! Directory-backed store backend.
//!
//! Each node is a directory under the configured root; its payload lives in
//! a hidden `.znode` file and its children are the non-hidden
//! subdirectories. One-shot watches are built on `notify` watchers that
//! disarm themselves after the first relevant event. A fired watcher marks
//! itself spent and is dropped on the next arm, so a node that is re-armed
//! after every change holds at most one live OS watch.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::ConnectionConfig;
use crate::store::client::{
    AclEntry, NodeStat, StoreClient, StoreConnector, WatchCallback, WatchEventType,
};
use crate::store::error::{StoreError, StoreResult};
use crate::store::path::NodePath;

const DATA_FILE: &str = ".znode";

/// Connects to a hierarchy rooted at the directory named by the `hosts` key.
#[derive(Debug, Default, Clone)]
pub struct FsConnector;

impl StoreConnector for FsConnector {
    fn connect(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn StoreClient>> {
        let root = config
            .hosts()
            .map(PathBuf::from)
            .ok_or_else(|| StoreError::OperationFailed("no root directory configured".to_string()))?;
        Ok(Arc::new(FsStore::open(root)?))
    }
}

#[derive(Default)]
struct WatchTable {
    active: HashMap<u64, RecommendedWatcher>,
    /// Watchers that already delivered their one event.
    spent: Vec<u64>,
}

impl WatchTable {
    /// Remove spent watchers. The caller drops them after releasing the lock.
    fn take_spent(&mut self) -> Vec<RecommendedWatcher> {
        let spent = std::mem::take(&mut self.spent);
        spent
            .into_iter()
            .filter_map(|id| self.active.remove(&id))
            .collect()
    }
}

/// A live connection to a directory-backed hierarchy.
pub struct FsStore {
    root: PathBuf,
    watches: Arc<Mutex<WatchTable>>,
    next_watch: AtomicU64,
    closed: AtomicBool,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::RemoteUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            watches: Arc::new(Mutex::new(WatchTable::default())),
            next_watch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn dir_of(&self, path: &NodePath) -> PathBuf {
        path.as_str()
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |dir, seg| dir.join(seg))
    }

    fn live_dir(&self, path: &NodePath) -> StoreResult<PathBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::RemoteUnavailable("connection closed".to_string()));
        }
        let dir = self.dir_of(path);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StoreError::NodeNotFound(path.to_string()))
        }
    }

    fn child_names(dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn stat_dir(dir: &Path) -> io::Result<NodeStat> {
        let millis = |t: io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        };
        let dir_meta = fs::metadata(dir)?;
        let data_meta = fs::metadata(dir.join(DATA_FILE)).ok();
        Ok(NodeStat {
            ctime: millis(dir_meta.created()),
            mtime: data_meta
                .as_ref()
                .map(|m| millis(m.modified()))
                .unwrap_or_else(|| millis(dir_meta.modified())),
            data_length: data_meta.map(|m| m.len() as usize).unwrap_or(0),
            num_children: Self::child_names(dir)?.len(),
            ..NodeStat::default()
        })
    }

    /// Arm a `notify` watcher that reports the first relevant event only.
    fn arm(&self, path: &NodePath, callback: WatchCallback) -> StoreResult<()> {
        let node_dir = self.dir_of(path);
        let exists = node_dir.is_dir();
        let target = if exists {
            node_dir.clone()
        } else {
            let parent = path
                .parent()
                .ok_or_else(|| StoreError::NodeNotFound(path.to_string()))?;
            self.live_dir(&parent)?
        };

        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        let table = Arc::downgrade(&self.watches);
        let fired = Arc::new(AtomicBool::new(false));
        let node_path = path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let Ok(event) = res else { return };
                let Some(kind) = classify(&event, &node_dir, exists) else {
                    return;
                };
                if !fired.swap(true, Ordering::SeqCst) {
                    if let Some(table) = table.upgrade() {
                        lock(&table).spent.push(id);
                    }
                    callback(&node_path, kind);
                }
            },
            Config::default(),
        )
        .map_err(|e| StoreError::OperationFailed(format!("cannot create watcher: {e}")))?;
        watcher
            .watch(&target, RecursiveMode::NonRecursive)
            .map_err(|e| StoreError::OperationFailed(format!("cannot watch {path}: {e}")))?;

        let spent = {
            let mut table = lock(&self.watches);
            table.active.insert(id, watcher);
            table.take_spent()
        };
        drop(spent);
        Ok(())
    }

    /// Number of OS watches still held, after dropping spent ones.
    pub fn live_watchers(&self) -> usize {
        let (spent, live) = {
            let mut table = lock(&self.watches);
            let spent = table.take_spent();
            (spent, table.active.len())
        };
        drop(spent);
        live
    }
}

/// Map a raw filesystem event onto the watched node's event type.
fn classify(event: &Event, node_dir: &Path, exists: bool) -> Option<WatchEventType> {
    if !exists {
        let created = matches!(event.kind, EventKind::Create(_))
            && event.paths.iter().any(|p| p == node_dir);
        return created.then_some(WatchEventType::NodeCreated);
    }
    if matches!(event.kind, EventKind::Access(_)) {
        return None;
    }
    for path in &event.paths {
        if path == node_dir && matches!(event.kind, EventKind::Remove(_)) {
            return Some(WatchEventType::NodeDeleted);
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(DATA_FILE) {
            return Some(WatchEventType::NodeDataChanged);
        }
        if path.parent() == Some(node_dir)
            && matches!(event.kind, EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_))
        {
            return Some(WatchEventType::NodeChildrenChanged);
        }
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn io_err(path: &NodePath, err: io::Error) -> StoreError {
    match err.kind() {
        ErrorKind::NotFound => StoreError::NodeNotFound(path.to_string()),
        _ => StoreError::OperationFailed(format!("{path}: {err}")),
    }
}

impl StoreClient for FsStore {
    fn get_children(&self, path: &NodePath) -> StoreResult<Vec<String>> {
        let dir = self.live_dir(path)?;
        Self::child_names(&dir).map_err(|e| io_err(path, e))
    }

    fn get_data(&self, path: &NodePath) -> StoreResult<Vec<u8>> {
        let dir = self.live_dir(path)?;
        match fs::read(dir.join(DATA_FILE)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_err(path, e)),
        }
    }

    fn set_data(
        &self,
        path: &NodePath,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        let dir = self.live_dir(path)?;
        if let Some(expected) = expected_version.filter(|v| *v != 0) {
            return Err(StoreError::OperationFailed(format!(
                "version mismatch on {path}: expected {expected}, found 0"
            )));
        }
        fs::write(dir.join(DATA_FILE), data).map_err(|e| io_err(path, e))?;
        Self::stat_dir(&dir).map_err(|e| io_err(path, e))
    }

    fn create(&self, path: &NodePath, data: &[u8]) -> StoreResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::OperationFailed("root already exists".to_string()))?;
        self.live_dir(&parent)?;
        let dir = self.dir_of(path);
        fs::create_dir(&dir).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StoreError::OperationFailed(format!("{path} already exists")),
            _ => io_err(path, e),
        })?;
        if !data.is_empty() {
            fs::write(dir.join(DATA_FILE), data).map_err(|e| io_err(path, e))?;
        }
        Ok(())
    }

    fn delete(&self, path: &NodePath) -> StoreResult<()> {
        if path.is_root() {
            return Err(StoreError::OperationFailed("cannot delete the root".to_string()));
        }
        let dir = self.live_dir(path)?;
        if !Self::child_names(&dir).map_err(|e| io_err(path, e))?.is_empty() {
            return Err(StoreError::OperationFailed(format!("{path} has children")));
        }
        fs::remove_dir_all(&dir).map_err(|e| io_err(path, e))
    }

    fn get_acl(&self, path: &NodePath) -> StoreResult<Vec<AclEntry>> {
        self.live_dir(path)?;
        Ok(vec![AclEntry::world_all()])
    }

    fn stat(&self, path: &NodePath) -> StoreResult<Option<NodeStat>> {
        match self.live_dir(path) {
            Ok(dir) => Self::stat_dir(&dir).map(Some).map_err(|e| io_err(path, e)),
            Err(StoreError::NodeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn register_watch(
        &self,
        path: &NodePath,
        callback: WatchCallback,
    ) -> StoreResult<Option<NodeStat>> {
        let stat = self.stat(path)?;
        self.arm(path, callback)?;
        Ok(stat)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let all = std::mem::take(&mut *lock(&self.watches));
        drop(all);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn path(p: &str) -> NodePath {
        NodePath::new(p).unwrap()
    }

    #[test]
    fn test_nodes_map_to_directories() {
        let temp = tempdir().unwrap();
        let store = FsStore::open(temp.path()).unwrap();

        store.create(&path("/a"), b"hello").unwrap();
        store.create(&path("/a/b"), b"").unwrap();
        store.create(&path("/a/c"), b"").unwrap();

        let mut children = store.get_children(&path("/a")).unwrap();
        children.sort();
        assert_eq!(children, vec!["b", "c"]);
        assert_eq!(store.get_data(&path("/a")).unwrap(), b"hello");
        assert_eq!(store.stat(&path("/a")).unwrap().unwrap().num_children, 2);
        assert!(store.stat(&path("/missing")).unwrap().is_none());
    }

    #[test]
    fn test_delete_requires_leaf() {
        let temp = tempdir().unwrap();
        let store = FsStore::open(temp.path()).unwrap();
        store.create(&path("/a"), b"").unwrap();
        store.create(&path("/a/b"), b"").unwrap();

        assert!(matches!(
            store.delete(&path("/a")),
            Err(StoreError::OperationFailed(_))
        ));
        store.delete(&path("/a/b")).unwrap();
        store.delete(&path("/a")).unwrap();
        assert!(matches!(
            store.get_children(&path("/a")),
            Err(StoreError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_open_rejects_missing_root() {
        let temp = tempdir().unwrap();
        assert!(FsStore::open(temp.path().join("nope")).is_err());
        let cfg = ConnectionConfig::new().with(crate::config::HOSTS_KEY, "");
        assert!(FsConnector.connect(&cfg).is_err());
    }

    #[test]
    fn test_data_watch_fires_once() {
        let temp = tempdir().unwrap();
        let store = FsStore::open(temp.path()).unwrap();
        store.create(&path("/x"), b"1").unwrap();

        let (tx, rx) = mpsc::channel();
        store
            .register_watch(
                &path("/x"),
                Arc::new(move |p: &NodePath, kind: WatchEventType| {
                    let _ = tx.send((p.clone(), kind));
                }),
            )
            .unwrap();

        store.set_data(&path("/x"), b"2", None).unwrap();
        let (fired, kind) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired, path("/x"));
        assert_eq!(kind, WatchEventType::NodeDataChanged);

        store.set_data(&path("/x"), b"3", None).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_fired_watchers_are_released_on_rearm() {
        let temp = tempdir().unwrap();
        let store = FsStore::open(temp.path()).unwrap();
        store.create(&path("/x"), b"0").unwrap();

        let (tx, rx) = mpsc::channel();
        for round in 1..=5 {
            let tx = tx.clone();
            store
                .register_watch(
                    &path("/x"),
                    Arc::new(move |_: &NodePath, kind: WatchEventType| {
                        let _ = tx.send(kind);
                    }),
                )
                .unwrap();
            assert_eq!(store.live_watchers(), 1);
            store
                .set_data(&path("/x"), round.to_string().as_bytes(), None)
                .unwrap();
            let kind = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(kind, WatchEventType::NodeDataChanged);
        }
        assert_eq!(store.live_watchers(), 0);

        store.register_watch(&path("/x"), Arc::new(|_: &NodePath, _: WatchEventType| {})).unwrap();
        store.close();
        assert_eq!(store.live_watchers(), 0);
    }
}
