//! Inspector controller.
//!
//! Ties the session, tree cache, watch registry and operation queue to a
//! [`TreeViewState`] living on the interactive loop. User actions call into
//! [`Inspector`]; every result comes back as a task posted to that loop.
//!
//! Refreshes follow a supersede policy: each request takes a ticket and
//! only the newest ticket's result is applied to the view.
//!
//! Every completion is tagged with the session epoch current when its
//! operation was submitted. Completions that arrive after a disconnect, or
//! after a reconnect to another session, are dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::{ConnectionConfig, ConnectionHistory, ConnectionTemplate};
use crate::ops::NodeOperationQueue;
use crate::store::{NodePath, StoreConnector, StoreSession};
use crate::tree::TreeCache;
use crate::ui::scheduler::Interactive;
use crate::ui::tree_view::{AclView, TreeViewState};
use crate::watch::{ArmResults, ChangeEvent, ChangeEventFanout, NodeListener, WatchRegistry};

/// Shows change events as toasts on the interactive loop.
///
/// Registered as the registry's default listener, so "unwatch" removes it
/// without naming it.
pub struct ToastNotifier {
    ui: Interactive<TreeViewState>,
}

impl ToastNotifier {
    pub fn new(ui: Interactive<TreeViewState>) -> Self {
        Self { ui }
    }

    /// Toast text: the node, the event type, then one line per attribute.
    pub fn format(event: &ChangeEvent) -> String {
        let mut text = format!("Node: {}\nEvent: {}", event.path, event.event_type);
        for (key, value) in &event.attributes {
            text.push_str(&format!("\n{key}: {value}"));
        }
        text
    }
}

impl NodeListener for ToastNotifier {
    fn process_event(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let text = Self::format(event);
        if !self.ui.post(move |state| state.toasts.push(text)) {
            anyhow::bail!("interactive loop closed");
        }
        Ok(())
    }
}

/// Controller behind the inspector's tree view.
///
/// Create it with [`InspectorBuilder`]. All methods are meant to be called
/// from the interactive loop; none of them blocks on the store.
pub struct Inspector {
    /// The one session every component shares.
    session: Arc<StoreSession>,
    /// Snapshot cache the view's node handles read from.
    cache: Arc<TreeCache>,
    registry: Arc<WatchRegistry>,
    queue: NodeOperationQueue<TreeViewState>,
    ui: Interactive<TreeViewState>,
    /// Default listener used by watch/unwatch of the selection.
    toaster: Arc<dyn NodeListener>,
    template: ConnectionTemplate,
    /// Where the last connection is remembered, if anywhere.
    history: Option<ConnectionHistory>,
    /// Newest refresh ticket handed out.
    refresh_ticket: Arc<AtomicU64>,
}

impl Inspector {
    /// The shared store session.
    pub fn session(&self) -> &Arc<StoreSession> {
        &self.session
    }

    /// The tree cache backing the displayed snapshot.
    pub fn cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    /// The watch registry, for listeners other than the toast notifier.
    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Fields and defaults offered in the connect dialog.
    pub fn template(&self) -> &ConnectionTemplate {
        &self.template
    }

    /// Operations whose completion has not reached the interactive loop yet.
    pub fn pending_operations(&self) -> usize {
        self.queue.in_flight()
    }

    /// The configuration to offer in the connect dialog.
    ///
    /// Prefers the last connection, then the saved default, then the
    /// template's defaults.
    pub fn suggested_connection(&self) -> ConnectionConfig {
        let Some(history) = &self.history else {
            return self.template.defaults();
        };
        match history.last_connection() {
            Ok(Some(last)) => self.template.complete(&last),
            Ok(None) => history
                .default_connection(&self.template)
                .unwrap_or_else(|_| self.template.defaults()),
            Err(e) => {
                tracing::warn!("Failed to read connection history: {}", e);
                self.template.defaults()
            }
        }
    }

    /// Connect in the background. On success the view is refreshed; on
    /// failure a notice is shown and any existing session is left alone.
    ///
    /// # Arguments
    /// * `config` - Connection settings; fields missing from it take the
    ///   template's defaults
    ///
    /// # Returns
    /// The background task, finished once the outcome is queued for the
    /// interactive loop.
    pub fn connect(self: &Arc<Self>, config: ConnectionConfig) -> JoinHandle<()> {
        let config = self.template.complete(&config);
        let session = Arc::clone(&self.session);
        let history = self.history.clone();
        let inspector = Arc::clone(self);
        self.ui.run_in_background(
            "connect",
            move || {
                let outcome = session.connect(&config);
                if outcome.is_ok() {
                    if let Some(history) = history {
                        if let Err(e) = history.set_last_connection(&config) {
                            tracing::warn!("Failed to record connection: {}", e);
                        }
                    }
                }
                outcome
            },
            move |state, outcome| match outcome {
                Ok(()) => {
                    tracing::info!("Connected");
                    inspector.registry.clear_all();
                    state.begin_session();
                    inspector.refresh_view(state);
                }
                Err(e) => {
                    tracing::warn!("Connect failed: {}", e);
                    state.notify("connect", format!("Unable to connect: {e}"));
                }
            },
        )
    }

    /// Close the session, forget every watch and clear the view.
    pub fn disconnect(self: &Arc<Self>, state: &mut TreeViewState) -> JoinHandle<()> {
        self.registry.clear_all();
        self.refresh_ticket.fetch_add(1, Ordering::SeqCst);
        state.end_session();
        let session = Arc::clone(&self.session);
        self.ui.run_in_background("disconnect", move || session.disconnect(), |state, outcome| {
            if let Err(e) = outcome {
                state.notify("disconnect", e.to_string());
            }
        })
    }

    /// Re-read the tree, keeping whichever expanded and selected nodes
    /// still exist.
    pub fn refresh_view(self: &Arc<Self>, state: &TreeViewState) -> JoinHandle<()> {
        let epoch = state.session_epoch();
        let ticket = self.refresh_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.refresh_ticket);
        let expanded: HashSet<_> = state.expanded().iter().cloned().collect();
        let selected: HashSet<_> = state.selected_nodes().into_iter().collect();

        self.queue.refresh(expanded, selected, move |state, outcome| {
            if latest.load(Ordering::SeqCst) != ticket {
                tracing::debug!("Refresh #{} superseded", ticket);
                return;
            }
            if !state.is_current(epoch) {
                return;
            }
            match outcome {
                Ok(tree) => state.apply_refresh(tree),
                Err(e) => state.notify("refresh", e.to_string()),
            }
        })
    }

    /// Delete every selected node and its descendants, then refresh.
    ///
    /// # Returns
    /// `None` when nothing is selected; a notice is shown instead.
    pub fn delete_selected(self: &Arc<Self>, state: &mut TreeViewState) -> Option<JoinHandle<()>> {
        let paths = state.selected_nodes();
        if paths.is_empty() {
            state.notify("delete", "Please select at least 1 node to be deleted");
            return None;
        }
        let epoch = state.session_epoch();
        let inspector = Arc::clone(self);
        Some(self.queue.delete(paths, move |state, report| {
            if !state.is_current(epoch) {
                return;
            }
            if let Some((path, e)) = report.failure() {
                state.notify("delete", format!("Unable to delete {path}: {e}"));
            }
            for path in report.deleted() {
                inspector.registry.clear_subtree(path);
            }
            inspector.refresh_view(state);
        }))
    }

    /// Create `name` under the first selected node, or under the root.
    pub fn add_node(self: &Arc<Self>, state: &TreeViewState, name: String) -> JoinHandle<()> {
        let parent = state
            .selected_nodes()
            .into_iter()
            .next()
            .unwrap_or_else(NodePath::root);
        let epoch = state.session_epoch();
        let inspector = Arc::clone(self);
        self.queue.create(parent, name, move |state, outcome| {
            if !state.is_current(epoch) {
                return;
            }
            match outcome {
                Ok(path) => {
                    tracing::info!("Created {}", path);
                    if let Some(parent) = path.parent() {
                        state.expand(parent);
                    }
                    inspector.refresh_view(state);
                }
                Err(e) => state.notify("create", e.to_string()),
            }
        })
    }

    /// Replace a node's payload, then refresh.
    pub fn set_data(
        self: &Arc<Self>,
        state: &TreeViewState,
        path: NodePath,
        data: Vec<u8>,
    ) -> JoinHandle<()> {
        let epoch = state.session_epoch();
        let inspector = Arc::clone(self);
        let target = path.clone();
        let written = data.clone();
        self.queue.set_data(path, data, move |state, outcome| {
            if !state.is_current(epoch) {
                return;
            }
            match outcome {
                Ok(_) => {
                    state.data = Some((target, written));
                    inspector.refresh_view(state);
                }
                Err(e) => state.notify("set data", e.to_string()),
            }
        })
    }

    /// Load a node's payload into the data viewer.
    pub fn open_data(&self, state: &TreeViewState, path: NodePath) -> JoinHandle<()> {
        let epoch = state.session_epoch();
        let target = path.clone();
        self.queue.get_data(path, move |state, outcome| {
            if !state.is_current(epoch) {
                return;
            }
            match outcome {
                Ok(data) => state.data = Some((target, data)),
                Err(e) => state.notify("get data", e.to_string()),
            }
        })
    }

    /// Load a node's ACL into the ACL viewer.
    pub fn show_acl(&self, state: &TreeViewState, path: NodePath) -> JoinHandle<()> {
        let epoch = state.session_epoch();
        let target = path.clone();
        self.queue.fetch_acl(path, move |state, outcome| {
            if !state.is_current(epoch) {
                return;
            }
            match outcome {
                Ok(entries) => {
                    state.acl = Some(AclView {
                        path: target,
                        entries: entries.iter().map(|e| e.to_map()).collect(),
                    });
                }
                Err(e) => state.notify("acl", e.to_string()),
            }
        })
    }

    /// Watch the selected nodes with the toast notifier.
    pub fn watch_selected(&self, state: &TreeViewState) -> JoinHandle<ArmResults> {
        self.registry
            .add_watchers(&state.selected_nodes(), &self.toaster)
    }

    pub fn unwatch_selected(&self, state: &TreeViewState) {
        self.registry.remove_default_watchers(&state.selected_nodes());
    }
}

/// Builder for [`Inspector`].
pub struct InspectorBuilder {
    connector: Arc<dyn StoreConnector>,
    cache_capacity: usize,
    event_buffer: usize,
    template: ConnectionTemplate,
    history_dir: Option<PathBuf>,
}

impl InspectorBuilder {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            cache_capacity: 10_000,
            event_buffer: 256,
            template: ConnectionTemplate::default(),
            history_dir: None,
        }
    }

    /// Upper bound on cached nodes per snapshot.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Capacity of the broadcast mirror of change events.
    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Connection fields and defaults; see [`ConnectionTemplate::default`].
    pub fn template(mut self, template: ConnectionTemplate) -> Self {
        self.template = template;
        self
    }

    /// Remember connections in `dir`.
    pub fn history_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history_dir = Some(dir.into());
        self
    }

    /// Build the inspector. Must be called from within a tokio runtime.
    pub fn build(self, ui: Interactive<TreeViewState>) -> Arc<Inspector> {
        let session = Arc::new(StoreSession::new(self.connector));
        let cache = TreeCache::with_capacity(Arc::clone(&session), self.cache_capacity);
        let fanout = Arc::new(ChangeEventFanout::new(self.event_buffer));
        let registry = WatchRegistry::spawn(Arc::clone(&session), fanout);
        let toaster: Arc<dyn NodeListener> = Arc::new(ToastNotifier::new(ui.clone()));
        registry.set_default_listener(&toaster);

        Arc::new(Inspector {
            queue: NodeOperationQueue::new(Arc::clone(&cache), ui.clone()),
            session,
            cache,
            registry,
            ui,
            toaster,
            template: self.template,
            history: self.history_dir.map(ConnectionHistory::new),
            refresh_ticket: Arc::new(AtomicU64::new(0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WatchEventType};
    use crate::ui::scheduler::InteractiveLoop;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn path(p: &str) -> NodePath {
        NodePath::new(p).unwrap()
    }

    async fn connected(
        store: &MemoryStore,
    ) -> (InteractiveLoop<TreeViewState>, Arc<Inspector>) {
        let (mut ui_loop, ui) = InteractiveLoop::new(TreeViewState::default());
        let inspector = InspectorBuilder::new(Arc::new(store.clone())).build(ui);
        inspector.connect(ConnectionConfig::new());
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 1).await);
        (ui_loop, inspector)
    }

    #[test]
    fn test_toast_format() {
        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert("version".to_string(), "3".to_string());
        let event = ChangeEvent::new(path("/x"), WatchEventType::NodeDataChanged)
            .with_attributes(attributes);
        assert_eq!(
            ToastNotifier::format(&event),
            "Node: /x\nEvent: NodeDataChanged\nversion: 3"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_notice() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let (mut ui_loop, ui) = InteractiveLoop::new(TreeViewState::default());
        let inspector = InspectorBuilder::new(Arc::new(store)).build(ui);

        inspector.connect(ConnectionConfig::new());
        assert!(ui_loop.run_until(WAIT, |s| !s.notices.is_empty()).await);
        let state = ui_loop.state();
        assert!(!state.connected);
        assert!(state.notices[0].message.starts_with("Unable to connect"));
        assert!(!inspector.session().is_connected());
    }

    #[tokio::test]
    async fn test_delete_with_empty_selection() {
        let store = MemoryStore::with_nodes([("/a", b"".as_slice())]).unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        let calls = store.calls();

        assert!(inspector.delete_selected(ui_loop.state_mut()).is_none());
        assert_eq!(
            ui_loop.state().notices[0].message,
            "Please select at least 1 node to be deleted"
        );
        assert_eq!(store.calls(), calls);
    }

    #[tokio::test]
    async fn test_delete_refreshes_view() {
        let store = MemoryStore::with_nodes([("/a/b", b"".as_slice()), ("/a/c", b"".as_slice())])
            .unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        let state = ui_loop.state_mut();
        state.expand(path("/a"));
        state.select([path("/a/b")]);

        inspector.delete_selected(ui_loop.state_mut());
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 2).await);
        let state = ui_loop.state();
        assert!(state.is_expanded(&path("/a")));
        assert!(state.selected_nodes().is_empty());
        let names: Vec<_> = inspector
            .cache()
            .children_of(&path("/a"))
            .unwrap()
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(names, vec!["/a/c"]);
    }

    #[tokio::test]
    async fn test_only_latest_refresh_applies() {
        let store = MemoryStore::with_nodes([("/a", b"".as_slice())]).unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;

        inspector.refresh_view(ui_loop.state());
        inspector.refresh_view(ui_loop.state());
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 2).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        ui_loop.run_pending();
        assert_eq!(inspector.pending_operations(), 0);
        assert_eq!(ui_loop.state().refreshes_applied, 2);
        let root = ui_loop.state().root.clone().unwrap();
        assert!(!root.is_stale());
    }

    #[tokio::test]
    async fn test_watch_selected_toasts_once() {
        let store = MemoryStore::with_nodes([("/x", b"".as_slice())]).unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        ui_loop.state_mut().select([path("/x")]);

        let armed = inspector.watch_selected(ui_loop.state()).await.unwrap();
        assert!(armed[0].1.is_ok());
        store.set(&path("/x"), b"v1").unwrap();
        assert!(ui_loop.run_until(WAIT, |s| !s.toasts.is_empty()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        ui_loop.run_pending();
        assert_eq!(ui_loop.state().toasts.len(), 1);
        assert!(ui_loop.state().toasts[0].starts_with("Node: /x\nEvent: NodeDataChanged"));

        inspector.unwatch_selected(ui_loop.state());
        assert!(!inspector.registry().is_watched(&path("/x")));
    }

    #[tokio::test]
    async fn test_disconnect_clears_view_and_watches() {
        let store = MemoryStore::with_nodes([("/x", b"".as_slice())]).unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        ui_loop.state_mut().select([path("/x")]);
        inspector.watch_selected(ui_loop.state()).await.unwrap();

        inspector.disconnect(ui_loop.state_mut()).await.unwrap();
        ui_loop.run_pending();
        let state = ui_loop.state();
        assert!(!state.connected);
        assert!(state.root.is_none());
        assert!(inspector.registry().watched_paths().is_empty());
        assert!(!inspector.session().is_connected());
    }

    #[tokio::test]
    async fn test_connect_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_nodes([("/a", b"".as_slice())]).unwrap();
        let (mut ui_loop, ui) = InteractiveLoop::new(TreeViewState::default());
        let inspector = InspectorBuilder::new(Arc::new(store))
            .history_dir(dir.path())
            .build(ui);
        assert_eq!(inspector.suggested_connection(), inspector.template().defaults());

        let config = ConnectionConfig::new().with(crate::config::HOSTS_KEY, "zk1:2181");
        inspector.connect(config);
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 1).await);
        assert_eq!(inspector.suggested_connection().hosts(), Some("zk1:2181"));
    }

    async fn settle(ui_loop: &mut InteractiveLoop<TreeViewState>, inspector: &Inspector) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while inspector.pending_operations() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        ui_loop.run_pending();
    }

    #[tokio::test]
    async fn test_completion_from_previous_session_is_dropped() {
        let store = MemoryStore::with_nodes([("/x", b"old".as_slice())]).unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        store.delay_data_reads(Duration::from_millis(500));

        inspector.open_data(ui_loop.state(), path("/x"));
        inspector.disconnect(ui_loop.state_mut()).await.unwrap();
        inspector.connect(ConnectionConfig::new());
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 2).await);
        assert!(ui_loop.state().connected);
        assert_eq!(inspector.pending_operations(), 1);

        settle(&mut ui_loop, &inspector).await;
        assert_eq!(inspector.pending_operations(), 0);
        let state = ui_loop.state();
        assert!(state.data.is_none());
        assert!(state.notices.is_empty());

        inspector.open_data(ui_loop.state(), path("/x"));
        assert!(ui_loop.run_until(WAIT, |s| s.data.is_some()).await);
        assert_eq!(ui_loop.state().data, Some((path("/x"), b"old".to_vec())));
    }

    #[tokio::test]
    async fn test_delete_clears_watches_below_deleted_node() {
        let store = MemoryStore::with_nodes([("/a/b", b"".as_slice()), ("/c", b"".as_slice())])
            .unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        ui_loop.state_mut().select([path("/a"), path("/a/b"), path("/c")]);
        inspector.watch_selected(ui_loop.state()).await.unwrap();

        ui_loop.state_mut().select([path("/a")]);
        inspector.delete_selected(ui_loop.state_mut());
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 2).await);
        assert!(!store.contains(&path("/a/b")));
        assert_eq!(inspector.registry().watched_paths(), vec![path("/c")]);
    }

    #[tokio::test]
    async fn test_add_node_and_acl() {
        let store = MemoryStore::with_nodes([("/p", b"".as_slice())]).unwrap();
        let (mut ui_loop, inspector) = connected(&store).await;
        ui_loop.state_mut().select([path("/p")]);

        inspector.add_node(ui_loop.state(), "kid".to_string());
        assert!(ui_loop.run_until(WAIT, |s| s.refreshes_applied == 2).await);
        assert!(store.contains(&path("/p/kid")));
        assert!(ui_loop.state().is_expanded(&path("/p")));

        inspector.show_acl(ui_loop.state(), path("/p/kid"));
        assert!(ui_loop.run_until(WAIT, |s| s.acl.is_some()).await);
        let acl = ui_loop.state().acl.clone().unwrap();
        assert_eq!(acl.path, path("/p/kid"));
        assert_eq!(acl.entries[0].get("scheme").map(String::as_str), Some("world"));
    }
}
