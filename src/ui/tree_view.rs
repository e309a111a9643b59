//! State owned by the interactive thread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::store::NodePath;
use crate::tree::{NodeHandle, RefreshedTree};

/// A blocking notice naming the failed operation and its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// The operation that failed, e.g. `delete`.
    pub operation: String,
    pub message: String,
}

/// ACL entries shown for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclView {
    pub path: NodePath,
    pub entries: Vec<BTreeMap<String, String>>,
}

/// Tree display state.
#[derive(Debug, Default)]
pub struct TreeViewState {
    /// Root of the snapshot currently displayed.
    pub root: Option<Arc<NodeHandle>>,
    expanded: BTreeSet<NodePath>,
    selected: BTreeSet<NodePath>,
    /// Whether a session is being shown.
    pub connected: bool,
    /// Failures waiting to be acknowledged by the user.
    pub notices: Vec<Notice>,
    /// Change notifications waiting to be shown.
    pub toasts: Vec<String>,
    /// ACL of the node last opened in the ACL viewer.
    pub acl: Option<AclView>,
    /// Payload of the node last opened in the data viewer.
    pub data: Option<(NodePath, Vec<u8>)>,
    /// Number of refreshed snapshots installed so far.
    pub refreshes_applied: u64,
    /// Bumped whenever a session begins or ends.
    session_epoch: u64,
}

impl TreeViewState {
    pub fn expand(&mut self, path: NodePath) {
        self.expanded.insert(path);
    }

    /// Collapse `path`; its expanded descendants are hidden with it.
    pub fn collapse(&mut self, path: &NodePath) {
        self.expanded.retain(|p| !p.starts_with(path));
    }

    pub fn is_expanded(&self, path: &NodePath) -> bool {
        self.expanded.contains(path)
    }

    pub fn expanded(&self) -> &BTreeSet<NodePath> {
        &self.expanded
    }

    pub fn select(&mut self, paths: impl IntoIterator<Item = NodePath>) {
        self.selected = paths.into_iter().collect();
    }

    /// Currently selected paths in display order.
    pub fn selected_nodes(&self) -> Vec<NodePath> {
        self.selected.iter().cloned().collect()
    }

    pub fn notify(&mut self, operation: &str, message: impl Into<String>) {
        self.notices.push(Notice {
            operation: operation.to_string(),
            message: message.into(),
        });
    }

    /// Install a refreshed snapshot with its restored expansion and selection.
    pub fn apply_refresh(&mut self, tree: RefreshedTree) {
        self.root = Some(tree.root);
        self.expanded = tree.expanded;
        self.selected = tree.selected;
        self.refreshes_applied += 1;
    }

    /// Identifies the current session. Capture it when submitting work and
    /// check it with [`is_current`](Self::is_current) on completion.
    pub fn session_epoch(&self) -> u64 {
        self.session_epoch
    }

    /// True while still connected to the session that was current at `epoch`.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.connected && self.session_epoch == epoch
    }

    /// Start showing a new session: clears the view and marks it connected.
    pub fn begin_session(&mut self) {
        self.session_epoch += 1;
        self.clear_view();
        self.connected = true;
    }

    /// Stop showing the current session.
    pub fn end_session(&mut self) {
        self.session_epoch += 1;
        self.clear_view();
        self.connected = false;
    }

    /// Forget everything shown, e.g. after a disconnect.
    pub fn clear_view(&mut self) {
        self.root = None;
        self.expanded.clear();
        self.selected.clear();
        self.acl = None;
        self.data = None;
    }

    /// Render the visible part of the tree, one indented line per node.
    /// Children are listed only under expanded nodes.
    ///
    /// Reads only what the current snapshot already holds and never calls
    /// the store. A node whose children were never fetched is drawn as
    /// collapsible.
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(root) = &self.root {
            self.render_node(root, 0, &mut lines);
        }
        lines
    }

    fn render_node(&self, node: &Arc<NodeHandle>, depth: usize, lines: &mut Vec<String>) {
        let known = node.peek_children();
        let expanded = self.is_expanded(node.path());
        let marker = match &known {
            Some(children) if children.is_empty() => ' ',
            Some(_) if expanded => '-',
            _ => '+',
        };
        let label = if node.path().is_root() { "/" } else { node.name() };
        lines.push(format!("{}{} {}", "  ".repeat(depth), marker, label));
        if expanded {
            for child in known.unwrap_or_default() {
                self.render_node(&child, depth + 1, lines);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> NodePath {
        NodePath::new(p).unwrap()
    }

    #[test]
    fn test_collapse_hides_descendants() {
        let mut state = TreeViewState::default();
        for p in ["/", "/a", "/a/b", "/ab"] {
            state.expand(path(p));
        }
        state.collapse(&path("/a"));
        assert!(state.is_expanded(&path("/")));
        assert!(!state.is_expanded(&path("/a/b")));
        assert!(state.is_expanded(&path("/ab")));
    }

    #[test]
    fn test_render_follows_expansion_without_store_calls() {
        use crate::config::ConnectionConfig;
        use crate::store::{MemoryStore, StoreSession};
        use crate::tree::TreeCache;
        use std::collections::HashSet;

        let store = MemoryStore::with_nodes([("/a/b", b"".as_slice()), ("/c", b"".as_slice())])
            .unwrap();
        let session = Arc::new(StoreSession::new(Arc::new(store.clone())));
        session.connect(&ConnectionConfig::new()).unwrap();
        let cache = TreeCache::new(session);

        let mut state = TreeViewState::default();
        let expanded: HashSet<_> = [NodePath::root()].into_iter().collect();
        state.apply_refresh(cache.refresh_restoring(&expanded, &HashSet::new()).unwrap());
        let calls = store.calls();
        assert_eq!(state.render(), vec!["- /", "  + a", "    c"]);
        assert_eq!(store.calls(), calls);

        // Expanded without a refresh: /a's children are known, /a/b's are not.
        state.expand(path("/a"));
        assert_eq!(state.render(), vec!["- /", "  - a", "    + b", "    c"]);
        assert_eq!(store.calls(), calls);

        let expanded: HashSet<_> = state.expanded().iter().cloned().collect();
        state.apply_refresh(cache.refresh_restoring(&expanded, &HashSet::new()).unwrap());
        let calls = store.calls();
        assert_eq!(state.render(), vec!["- /", "  - a", "      b", "    c"]);
        assert_eq!(store.calls(), calls);
    }

    #[test]
    fn test_render_empty_without_root() {
        assert!(TreeViewState::default().render().is_empty());
    }

    #[test]
    fn test_session_epoch() {
        let mut state = TreeViewState::default();
        state.begin_session();
        let epoch = state.session_epoch();
        assert!(state.is_current(epoch));
        state.end_session();
        assert!(!state.is_current(epoch));
        state.begin_session();
        assert!(!state.is_current(epoch));
        assert!(state.is_current(state.session_epoch()));
    }

    #[test]
    fn test_clear_view() {
        let mut state = TreeViewState::default();
        state.expand(path("/a"));
        state.select([path("/a")]);
        state.clear_view();
        assert!(state.expanded().is_empty());
        assert!(state.selected_nodes().is_empty());
    }
}
