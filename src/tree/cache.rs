//! Lazily populated view of the remote hierarchy.
//!
//! `TreeCache` never preloads the tree. Lookups read through to the
//! [`StoreSession`] and are remembered in a bounded LRU cache for the
//! lifetime of one snapshot, so a renderer asking for a child count and then
//! each child by index sees a consistent listing. `refresh` drops every cached
//! lookup and hands out a fresh root [`NodeHandle`].

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lru::LruCache;

use crate::store::{NodePath, NodeStat, StoreError, StoreResult, StoreSession};

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Default, Clone)]
struct CachedNode {
    /// Sorted child names.
    children: Option<Arc<Vec<String>>>,
    /// `Some(None)` records that the node was missing.
    stat: Option<Option<NodeStat>>,
}

/// Statistics about cache usage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeCacheStats {
    /// Lookups answered from the current snapshot
    pub hits: u64,
    /// Lookups that had to go to the store
    pub misses: u64,
    /// Number of invalidations
    pub refreshes: u64,
}

/// Result of a refresh that re-fetched the previously visible paths.
#[derive(Debug, Clone)]
pub struct RefreshedTree {
    /// Root handle of the new snapshot.
    pub root: Arc<NodeHandle>,
    /// Generation the snapshot was taken at.
    pub generation: u64,
    /// Previously expanded paths that still exist.
    pub expanded: BTreeSet<NodePath>,
    /// Previously selected paths that still exist.
    pub selected: BTreeSet<NodePath>,
}

/// Per-snapshot cache of child lists and node metadata.
pub struct TreeCache {
    session: Arc<StoreSession>,
    entries: Mutex<LruCache<NodePath, CachedNode>>,
    generation: AtomicU64,
    refresh_lock: Mutex<()>,
    stats: Mutex<TreeCacheStats>,
}

impl TreeCache {
    /// Create a cache with the default capacity.
    pub fn new(session: Arc<StoreSession>) -> Arc<Self> {
        Self::with_capacity(session, DEFAULT_CAPACITY)
    }

    /// Create a cache remembering at most `capacity` nodes per snapshot.
    pub fn with_capacity(session: Arc<StoreSession>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            session,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            stats: Mutex::new(TreeCacheStats::default()),
        })
    }

    /// The session lookups read through to.
    pub fn session(&self) -> &Arc<StoreSession> {
        &self.session
    }

    /// Generation of the current snapshot; bumped by every refresh.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Get statistics about cache usage.
    pub fn stats(&self) -> TreeCacheStats {
        lock(&self.stats).clone()
    }

    /// Number of nodes currently held.
    pub fn cached_len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Children of `path`, read from the store now and sorted by name.
    ///
    /// A missing node yields an empty list.
    pub fn children_of(&self, path: &NodePath) -> StoreResult<Vec<NodePath>> {
        let names = self.fetch_children(path)?;
        names.iter().map(|name| path.child(name)).collect()
    }

    /// Whether `path` exists right now.
    pub fn exists(&self, path: &NodePath) -> StoreResult<bool> {
        Ok(self.fetch_stat(path)?.is_some())
    }

    fn fetch_children(&self, path: &NodePath) -> StoreResult<Arc<Vec<String>>> {
        let mut names = match self.session.get_children(path) {
            Ok(names) => names,
            Err(StoreError::NodeNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        names.sort();
        names.dedup();
        let names = Arc::new(names);
        lock(&self.entries)
            .get_or_insert_mut(path.clone(), CachedNode::default)
            .children = Some(Arc::clone(&names));
        Ok(names)
    }

    fn fetch_stat(&self, path: &NodePath) -> StoreResult<Option<NodeStat>> {
        let stat = self.session.stat(path)?;
        lock(&self.entries)
            .get_or_insert_mut(path.clone(), CachedNode::default)
            .stat = Some(stat.clone());
        Ok(stat)
    }

    /// Sorted child names, served from the snapshot cache when possible.
    pub fn cached_children(&self, path: &NodePath) -> StoreResult<Arc<Vec<String>>> {
        let hit = lock(&self.entries).get(path).and_then(|n| n.children.clone());
        match hit {
            Some(names) => {
                lock(&self.stats).hits += 1;
                Ok(names)
            }
            None => {
                lock(&self.stats).misses += 1;
                self.fetch_children(path)
            }
        }
    }

    /// Sorted child names if this snapshot already holds them. Never calls
    /// the store, so it is safe on the interactive thread.
    pub fn peek_children(&self, path: &NodePath) -> Option<Arc<Vec<String>>> {
        lock(&self.entries).peek(path).and_then(|n| n.children.clone())
    }

    /// Node metadata, served from the snapshot cache when possible.
    pub fn cached_stat(&self, path: &NodePath) -> StoreResult<Option<NodeStat>> {
        let hit = lock(&self.entries).get(path).and_then(|n| n.stat.clone());
        match hit {
            Some(stat) => {
                lock(&self.stats).hits += 1;
                Ok(stat)
            }
            None => {
                lock(&self.stats).misses += 1;
                self.fetch_stat(path)
            }
        }
    }

    /// Drop every cached lookup and return a fresh traversal root.
    ///
    /// Handles from earlier snapshots stay usable; they read through to the
    /// store like any other handle.
    pub fn refresh(self: &Arc<Self>) -> Arc<NodeHandle> {
        let _guard = lock(&self.refresh_lock);
        self.invalidate()
    }

    fn invalidate(self: &Arc<Self>) -> Arc<NodeHandle> {
        lock(&self.entries).clear();
        lock(&self.stats).refreshes += 1;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Tree cache refreshed, generation {}", generation);
        NodeHandle::root(Arc::clone(self), generation)
    }

    /// Refresh and re-fetch the given expanded paths so the new snapshot can
    /// be shown already expanded. Paths that vanished are dropped.
    ///
    /// The child lists of every child of a kept path are fetched too, so a
    /// renderer can tell leaves apart without touching the store.
    ///
    /// # Arguments
    /// * `expanded` - Paths expanded in the view before the refresh
    /// * `selected` - Paths selected in the view before the refresh
    ///
    /// Refreshes are serialized: a second caller waits for the first to
    /// finish re-fetching before it invalidates the cache again.
    pub fn refresh_restoring(
        self: &Arc<Self>,
        expanded: &HashSet<NodePath>,
        selected: &HashSet<NodePath>,
    ) -> StoreResult<RefreshedTree> {
        let _guard = lock(&self.refresh_lock);
        let root = self.invalidate();
        let generation = root.generation;

        let mut ordered: Vec<&NodePath> = expanded.iter().collect();
        ordered.sort_by_key(|p| (p.depth(), (*p).clone()));
        let mut kept = BTreeSet::new();
        for path in ordered {
            if self.cached_stat(path)?.is_some() {
                for name in self.cached_children(path)?.iter() {
                    self.cached_children(&path.child(name)?)?;
                }
                kept.insert(path.clone());
            }
        }

        let mut still_selected = BTreeSet::new();
        for path in selected {
            if self.cached_stat(path)?.is_some() {
                still_selected.insert(path.clone());
            }
        }

        Ok(RefreshedTree {
            root,
            generation,
            expanded: kept,
            selected: still_selected,
        })
    }
}

/// One path within a traversal.
///
/// Handles hold no children of their own; every structural query goes to
/// the cache when asked. The parent reference is weak: the parent owns the
/// enumeration of its children, never the other way round.
pub struct NodeHandle {
    path: NodePath,
    parent: Weak<NodeHandle>,
    cache: Arc<TreeCache>,
    generation: u64,
}

impl NodeHandle {
    fn root(cache: Arc<TreeCache>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            path: NodePath::root(),
            parent: Weak::new(),
            cache,
            generation,
        })
    }

    fn child_handle(self: &Arc<Self>, name: &str) -> StoreResult<Arc<NodeHandle>> {
        Ok(Arc::new(Self {
            path: self.path.child(name)?,
            parent: Arc::downgrade(self),
            cache: Arc::clone(&self.cache),
            generation: self.generation,
        }))
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// The last path segment, shown as the node label.
    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn parent(&self) -> Option<Arc<NodeHandle>> {
        self.parent.upgrade()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once a later refresh replaced this handle's snapshot.
    pub fn is_stale(&self) -> bool {
        self.generation != self.cache.generation()
    }

    pub fn children(self: &Arc<Self>) -> StoreResult<Vec<Arc<NodeHandle>>> {
        self.cache
            .cached_children(&self.path)?
            .iter()
            .map(|name| self.child_handle(name))
            .collect()
    }

    /// Child handles if this snapshot already lists them; see
    /// [`TreeCache::peek_children`].
    pub fn peek_children(self: &Arc<Self>) -> Option<Vec<Arc<NodeHandle>>> {
        let names = self.cache.peek_children(&self.path)?;
        Some(
            names
                .iter()
                .filter_map(|name| self.child_handle(name).ok())
                .collect(),
        )
    }

    pub fn child_count(&self) -> StoreResult<usize> {
        Ok(self.cache.cached_children(&self.path)?.len())
    }

    pub fn child_at(self: &Arc<Self>, index: usize) -> StoreResult<Option<Arc<NodeHandle>>> {
        let names = self.cache.cached_children(&self.path)?;
        names.get(index).map(|name| self.child_handle(name)).transpose()
    }

    /// Position of this node among its parent's children.
    pub fn index_in_parent(&self) -> StoreResult<Option<usize>> {
        let Some(parent) = self.path.parent() else {
            return Ok(None);
        };
        let names = self.cache.cached_children(&parent)?;
        Ok(names.binary_search_by(|n| n.as_str().cmp(self.name())).ok())
    }

    pub fn is_leaf(&self) -> StoreResult<bool> {
        Ok(self.child_count()? == 0)
    }

    /// Ephemeral nodes cannot have children.
    pub fn allows_children(&self) -> StoreResult<bool> {
        Ok(self
            .cache
            .cached_stat(&self.path)?
            .map_or(false, |stat| !stat.is_ephemeral()))
    }

    pub fn stat(&self) -> StoreResult<Option<NodeStat>> {
        self.cache.cached_stat(&self.path)
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        if self.path != other.path {
            return false;
        }
        match (self.parent.upgrade(), other.parent.upgrade()) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for NodeHandle {}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::store::MemoryStore;

    fn path(p: &str) -> NodePath {
        NodePath::new(p).unwrap()
    }

    fn connected(store: &MemoryStore) -> Arc<TreeCache> {
        let session = Arc::new(StoreSession::new(Arc::new(store.clone())));
        session.connect(&ConnectionConfig::new()).unwrap();
        TreeCache::new(session)
    }

    fn sample() -> MemoryStore {
        MemoryStore::with_nodes([
            ("/a/c", b"".as_slice()),
            ("/a/b", b"".as_slice()),
            ("/z", b"".as_slice()),
        ])
        .unwrap()
    }

    #[test]
    fn test_children_sorted_and_missing_is_empty() {
        let cache = connected(&sample());
        let children = cache.children_of(&path("/a")).unwrap();
        assert_eq!(children, vec![path("/a/b"), path("/a/c")]);
        assert!(cache.children_of(&path("/nope")).unwrap().is_empty());
    }

    #[test]
    fn test_children_of_reads_through() {
        let store = sample();
        let cache = connected(&store);
        assert_eq!(cache.children_of(&path("/a")).unwrap().len(), 2);
        store.remove(&path("/a/b")).unwrap();
        assert_eq!(cache.children_of(&path("/a")).unwrap(), vec![path("/a/c")]);
    }

    #[test]
    fn test_handles_are_lazy_and_consistent_within_snapshot() {
        let store = sample();
        let cache = connected(&store);
        let root = cache.refresh();
        assert_eq!(root.child_count().unwrap(), 2);

        // Cached for this snapshot even though the store changed.
        store.create_all(&path("/m"), b"").unwrap();
        assert_eq!(root.child_count().unwrap(), 2);
        let a = root.child_at(0).unwrap().unwrap();
        assert_eq!(a.name(), "a");
        assert_eq!(a.index_in_parent().unwrap(), Some(0));
        assert!(!a.is_leaf().unwrap());
        assert!(a.child_at(5).unwrap().is_none());

        let fresh = cache.refresh();
        assert!(root.is_stale());
        assert!(!fresh.is_stale());
        assert_eq!(fresh.child_count().unwrap(), 3);
        // The old handle keeps working and sees current state.
        assert_eq!(root.child_count().unwrap(), 3);
    }

    #[test]
    fn test_handle_equality_follows_parent_chain() {
        let cache = connected(&sample());
        let root = cache.refresh();
        let a1 = root.child_at(0).unwrap().unwrap();
        let a2 = root.children().unwrap().remove(0);
        assert_eq!(*a1, *a2);
        assert_eq!(a1.parent().unwrap().path(), &NodePath::root());

        let b = a1.child_at(0).unwrap().unwrap();
        assert_ne!(*b, *a1);
    }

    #[test]
    fn test_ephemeral_disallows_children() {
        let store = sample();
        store.create_ephemeral(&path("/e"), 7).unwrap();
        let cache = connected(&store);
        let root = cache.refresh();
        let kids = root.children().unwrap();
        let e = kids.iter().find(|h| h.name() == "e").unwrap();
        assert!(!e.allows_children().unwrap());
        assert!(kids[0].allows_children().unwrap());
    }

    #[test]
    fn test_refresh_restoring_drops_vanished_paths() {
        let store = sample();
        let cache = connected(&store);
        let expanded: HashSet<_> = [path("/"), path("/a"), path("/z")].into_iter().collect();
        let selected: HashSet<_> = [path("/a/b"), path("/z")].into_iter().collect();

        store.remove(&path("/z")).unwrap();
        store.remove(&path("/a/b")).unwrap();
        let refreshed = cache.refresh_restoring(&expanded, &selected).unwrap();

        assert_eq!(
            refreshed.expanded.into_iter().collect::<Vec<_>>(),
            vec![path("/"), path("/a")]
        );
        assert!(refreshed.selected.is_empty());
        assert_eq!(refreshed.generation, cache.generation());
        // Expanded paths were prefetched into the new snapshot.
        let misses = cache.stats().misses;
        refreshed.root.child_count().unwrap();
        assert_eq!(cache.stats().misses, misses);
    }

    #[test]
    fn test_refresh_prefetches_children_of_expanded() {
        let store = sample();
        let cache = connected(&store);
        let expanded: HashSet<_> = [path("/")].into_iter().collect();
        let refreshed = cache.refresh_restoring(&expanded, &HashSet::new()).unwrap();

        let calls = store.calls();
        let kids = refreshed.root.peek_children().unwrap();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0].peek_children().unwrap().len(), 2);
        assert!(kids[1].peek_children().unwrap().is_empty());
        assert!(cache.peek_children(&path("/a/b")).is_none());
        assert_eq!(store.calls(), calls);
    }

    #[test]
    fn test_concurrent_refreshes_do_not_interleave() {
        let store = sample();
        let cache = connected(&store);
        let expanded: HashSet<_> = [path("/"), path("/a")].into_iter().collect();

        let results: Vec<RefreshedTree> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|i| {
                    let cache = Arc::clone(&cache);
                    let store = store.clone();
                    let expanded = expanded.clone();
                    scope.spawn(move || {
                        if i == 1 {
                            store.create_all(&path("/a/d"), b"").unwrap();
                        }
                        cache.refresh_restoring(&expanded, &HashSet::new()).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut generations: Vec<_> = results.iter().map(|r| r.generation).collect();
        generations.sort();
        generations.dedup();
        assert_eq!(generations.len(), 2);
        assert_eq!(cache.generation(), *generations.last().unwrap());
        for result in &results {
            assert_eq!(result.root.generation(), result.generation);
            assert_eq!(
                result.expanded.iter().collect::<Vec<_>>(),
                vec![&path("/"), &path("/a")]
            );
        }
        assert_eq!(cache.stats().refreshes, 2);

        // The snapshot left behind is complete for the newest generation.
        let newest = results.iter().max_by_key(|r| r.generation).unwrap();
        let calls = store.calls();
        let a = cache.peek_children(&path("/a")).unwrap();
        assert_eq!(a.as_slice(), ["b", "c", "d"]);
        assert!(newest.root.peek_children().is_some());
        assert_eq!(store.calls(), calls);
    }

    #[test]
    fn test_lru_bound() {
        let store = sample();
        let session = Arc::new(StoreSession::new(Arc::new(store)));
        session.connect(&ConnectionConfig::new()).unwrap();
        let cache = TreeCache::with_capacity(session, 2);
        for p in ["/", "/a", "/z"] {
            cache.cached_children(&path(p)).unwrap();
        }
        assert_eq!(cache.cached_len(), 2);
    }

    #[test]
    fn test_not_connected_surfaces() {
        let session = Arc::new(StoreSession::new(Arc::new(MemoryStore::new())));
        let cache = TreeCache::new(session);
        assert_eq!(cache.children_of(&NodePath::root()), Err(StoreError::NotConnected));
    }
}
