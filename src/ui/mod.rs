//! Interactive side of the inspector.
//!
//! Everything that touches displayed state runs on the interactive loop;
//! background work reports back by posting tasks to it.

pub mod inspector;
pub mod scheduler;
pub mod tree_view;

pub use inspector::{Inspector, InspectorBuilder, ToastNotifier};
pub use scheduler::{Interactive, InteractiveLoop, UiTask};
pub use tree_view::{AclView, Notice, TreeViewState};
