//! ZNode Inspector
//!
//! Keeps a browsable view of a remote hierarchical key-value store in sync
//! with the store itself, and manages the one-shot watches that tell it when
//! a node changes.
//!
//! ## What it handles
//!
//! - A single session to the store, replaced atomically on reconnect
//! - A lazily populated tree cache that is invalidated and re-read on refresh
//! - Watches that the store fires only once, re-armed for as long as anyone
//!   is still listening
//! - Mutations run off the interactive thread, with results posted back to it
//!
//! ## Flow
//!
//! ```text
//! User action (delete / set data / refresh)
//!        ↓
//! NodeOperationQueue [WORKER THREAD]
//!        ↓
//! StoreSession → StoreClient (remote store)
//!        ↓
//! Interactive::post(on_complete)
//!        ↓
//! TreeViewState updated [INTERACTIVE LOOP]
//!
//! Remote change
//!        ↓
//! one-shot watch fires [STORE THREAD]
//!        ↓
//! WatchRegistry re-arms, then ChangeEventFanout
//!        ↓
//! NodeListener::process_event (e.g. ToastNotifier → toast)
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use znode_inspector::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (mut ui_loop, ui) = InteractiveLoop::new(TreeViewState::default());
//!     let inspector = InspectorBuilder::new(Arc::new(FsConnector))
//!         .cache_capacity(50_000)
//!         .history_dir("/tmp/znode-inspector")
//!         .build(ui);
//!
//!     let config = inspector.suggested_connection().with(HOSTS_KEY, "/srv/tree");
//!     inspector.connect(config);
//!
//!     while ui_loop.run_next().await {
//!         for line in ui_loop.state().render() {
//!             println!("{line}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`store`]: Paths, the store client capability and its backends, the session
//! - [`config`]: Connection settings and connection history
//! - [`tree`]: Tree cache and node handles
//! - [`watch`]: Watch registry and change event fanout
//! - [`ops`]: Background node operations
//! - [`ui`]: Interactive loop, view state and the inspector controller

pub mod config;
pub mod ops;
pub mod store;
pub mod tree;
pub mod ui;
pub mod watch;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::config::{
        ConfigError, ConnectionConfig, ConnectionHistory, ConnectionTemplate, HOSTS_KEY,
        TIMEOUT_KEY,
    };
    pub use crate::ops::{DeleteOutcome, DeleteReport, NodeOperationQueue};
    pub use crate::store::{
        FsConnector, MemoryStore, NodePath, NodeStat, StoreClient, StoreConnector, StoreError,
        StoreResult, StoreSession, WatchEventType,
    };
    pub use crate::tree::{NodeHandle, TreeCache};
    pub use crate::ui::{Inspector, InspectorBuilder, Interactive, InteractiveLoop, TreeViewState};
    pub use crate::watch::{ChangeEvent, ChangeEventFanout, NodeListener, WatchRegistry};
}
