//! Per-path watch subscriptions.
//!
//! Store watches are one-shot, so every subscription walks the cycle
//! `Unregistered -> Arming -> Armed -> Fired -> (Armed | dropped)`. The
//! registry re-arms after each fire for as long as the path has listeners,
//! then hands a [`ChangeEvent`] to the [`ChangeEventFanout`].
//!
//! Raw fires arrive on a store-owned thread. The callback only forwards them
//! into a channel; a dispatcher task does the re-arm and delivery.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::{
    NodePath, NodeStat, StoreError, StoreResult, StoreSession, WatchCallback, WatchEventType,
};
use crate::watch::fanout::{ChangeEvent, ChangeEventFanout, NodeListener};

/// Where a path's remote watch currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unregistered,
    /// A register request is in flight.
    Arming,
    Armed,
    /// Fired and waiting to be re-armed.
    Fired,
}

struct Subscription {
    listeners: Vec<Weak<dyn NodeListener>>,
    state: WatchState,
}

impl Subscription {
    fn new() -> Self {
        Self {
            listeners: Vec::new(),
            state: WatchState::Unregistered,
        }
    }

    /// Forget listeners that have been dropped.
    fn prune(&mut self) {
        self.listeners.retain(|w| w.strong_count() > 0);
    }

    fn position(&self, listener: &Arc<dyn NodeListener>) -> Option<usize> {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .iter()
            .position(|w| w.as_ptr() as *const () == target)
    }

    fn live(&self) -> Vec<Arc<dyn NodeListener>> {
        self.listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

#[derive(Debug)]
struct RawFire {
    path: NodePath,
    event_type: WatchEventType,
    epoch: u64,
}

/// Outcome of arming one path after `add_watchers`.
pub type ArmResults = Vec<(NodePath, StoreResult<()>)>;

pub struct WatchRegistry {
    session: Arc<StoreSession>,
    fanout: Arc<ChangeEventFanout>,
    subscriptions: Mutex<HashMap<NodePath, Subscription>>,
    default_listener: Mutex<Option<Weak<dyn NodeListener>>>,
    raw_tx: mpsc::UnboundedSender<RawFire>,
    /// Bumped by `clear_all`; fires armed under an older epoch are ignored.
    epoch: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WatchRegistry {
    /// Create a registry and start its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(session: Arc<StoreSession>, fanout: Arc<ChangeEventFanout>) -> Arc<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            session,
            fanout,
            subscriptions: Mutex::new(HashMap::new()),
            default_listener: Mutex::new(None),
            raw_tx,
            epoch: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::dispatch_loop(Arc::downgrade(&registry), raw_rx));
        *lock(&registry.dispatcher) = Some(handle);
        registry
    }

    pub fn fanout(&self) -> &Arc<ChangeEventFanout> {
        &self.fanout
    }

    /// Set the listener removed by [`remove_default_watchers`](Self::remove_default_watchers).
    pub fn set_default_listener(&self, listener: &Arc<dyn NodeListener>) {
        *lock(&self.default_listener) = Some(Arc::downgrade(listener));
    }

    /// Register `listener` on each path. Paths without a live remote watch
    /// get one; the returned task reports how arming went.
    pub fn add_watchers(
        self: &Arc<Self>,
        paths: &[NodePath],
        listener: &Arc<dyn NodeListener>,
    ) -> JoinHandle<ArmResults> {
        let mut to_arm = Vec::new();
        {
            let mut subs = lock(&self.subscriptions);
            for path in paths {
                let sub = subs.entry(path.clone()).or_insert_with(Subscription::new);
                sub.prune();
                if sub.position(listener).is_none() {
                    sub.listeners.push(Arc::downgrade(listener));
                }
                if sub.state == WatchState::Unregistered {
                    sub.state = WatchState::Arming;
                    to_arm.push(path.clone());
                }
            }
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(to_arm.len());
            for path in to_arm {
                let outcome = registry.arm(&path).await.map(|_| ());
                if let Err(e) = &outcome {
                    tracing::warn!("Failed to watch {}: {}", path, e);
                }
                results.push((path, outcome));
            }
            results
        })
    }

    /// Remove `listener` from each path. A path left without listeners is
    /// not re-armed again.
    pub fn remove_watchers(&self, paths: &[NodePath], listener: &Arc<dyn NodeListener>) {
        let mut subs = lock(&self.subscriptions);
        for path in paths {
            if let Some(sub) = subs.get_mut(path) {
                if let Some(idx) = sub.position(listener) {
                    sub.listeners.remove(idx);
                }
                sub.prune();
                if sub.listeners.is_empty() && sub.state == WatchState::Unregistered {
                    subs.remove(path);
                }
            }
        }
    }

    /// Remove the default listener from each path.
    pub fn remove_default_watchers(&self, paths: &[NodePath]) {
        let listener = lock(&self.default_listener).as_ref().and_then(Weak::upgrade);
        match listener {
            Some(listener) => self.remove_watchers(paths, &listener),
            None => tracing::debug!("No default listener registered"),
        }
    }

    /// Drop every listener on `path`.
    pub fn clear(&self, path: &NodePath) {
        let mut subs = lock(&self.subscriptions);
        if let Some(sub) = subs.get_mut(path) {
            sub.listeners.clear();
            if sub.state == WatchState::Unregistered {
                subs.remove(path);
            }
        }
    }

    /// Drop every listener on `root` and on each path below it, e.g. after
    /// the subtree was deleted.
    pub fn clear_subtree(&self, root: &NodePath) {
        let mut subs = lock(&self.subscriptions);
        subs.retain(|path, sub| {
            if !path.starts_with(root) {
                return true;
            }
            sub.listeners.clear();
            sub.state != WatchState::Unregistered
        });
    }

    /// Forget every subscription, e.g. after a disconnect. Watches armed
    /// before this call are ignored if they fire later.
    pub fn clear_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscriptions).clear();
    }

    pub fn is_watched(&self, path: &NodePath) -> bool {
        lock(&self.subscriptions)
            .get(path)
            .map_or(false, |sub| sub.listeners.iter().any(|w| w.strong_count() > 0))
    }

    pub fn listener_count(&self, path: &NodePath) -> usize {
        lock(&self.subscriptions)
            .get(path)
            .map_or(0, |sub| sub.live().len())
    }

    pub fn state(&self, path: &NodePath) -> Option<WatchState> {
        lock(&self.subscriptions).get(path).map(|sub| sub.state)
    }

    /// Paths that currently have at least one listener, sorted.
    pub fn watched_paths(&self) -> Vec<NodePath> {
        let mut paths: Vec<_> = lock(&self.subscriptions)
            .iter()
            .filter(|(_, sub)| sub.listeners.iter().any(|w| w.strong_count() > 0))
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Stop the dispatcher task.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }

    fn callback(&self, epoch: u64) -> WatchCallback {
        let tx = self.raw_tx.clone();
        Arc::new(move |path: &NodePath, event_type: WatchEventType| {
            let fire = RawFire {
                path: path.clone(),
                event_type,
                epoch,
            };
            if tx.send(fire).is_err() {
                tracing::debug!("Watch fired on {} after the registry shut down", path);
            }
        })
    }

    /// Issue a one-shot watch for `path` on a worker thread.
    async fn arm(&self, path: &NodePath) -> StoreResult<Option<NodeStat>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = Arc::clone(&self.session);
        let callback = self.callback(epoch);
        let target = path.clone();
        let outcome = tokio::task::spawn_blocking(move || session.register_watch(&target, callback))
            .await
            .unwrap_or_else(|e| Err(StoreError::OperationFailed(format!("watch task failed: {e}"))));

        if self.epoch.load(Ordering::SeqCst) == epoch {
            if let Some(sub) = lock(&self.subscriptions).get_mut(path) {
                sub.state = if outcome.is_ok() {
                    WatchState::Armed
                } else {
                    WatchState::Unregistered
                };
            }
        }
        outcome
    }

    async fn dispatch_loop(registry: Weak<Self>, mut rx: mpsc::UnboundedReceiver<RawFire>) {
        while let Some(fire) = rx.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.handle_fire(fire).await;
        }
        tracing::debug!("Watch dispatcher stopped");
    }

    async fn handle_fire(&self, fire: RawFire) {
        if fire.epoch != self.epoch.load(Ordering::SeqCst) {
            tracing::debug!("Ignoring stale watch on {}", fire.path);
            return;
        }

        let rearm = {
            let mut subs = lock(&self.subscriptions);
            match subs.get_mut(&fire.path) {
                Some(sub) => {
                    sub.prune();
                    if sub.listeners.is_empty() {
                        subs.remove(&fire.path);
                        false
                    } else {
                        sub.state = WatchState::Fired;
                        true
                    }
                }
                None => false,
            }
        };
        if !rearm {
            tracing::debug!("Dropping {} on {}: no listeners", fire.event_type, fire.path);
            return;
        }

        // Re-arm before delivery so no change slips between fire and watch.
        let attributes = match self.arm(&fire.path).await {
            Ok(stat) => stat.map(|s| s.to_attributes()).unwrap_or_default(),
            Err(e) => {
                let err = StoreError::WatchRearmFailed {
                    path: fire.path.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", err);
                BTreeMap::new()
            }
        };

        let listeners = lock(&self.subscriptions)
            .get(&fire.path)
            .map(Subscription::live)
            .unwrap_or_default();
        if listeners.is_empty() {
            tracing::debug!("Listeners for {} went away before delivery", fire.path);
            return;
        }

        let event = ChangeEvent::new(fire.path, fire.event_type).with_attributes(attributes);
        let fanout = Arc::clone(&self.fanout);
        if let Err(e) = tokio::task::spawn_blocking(move || fanout.dispatch(&event, &listeners)).await {
            tracing::error!("Event delivery task failed: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
