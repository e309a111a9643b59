//! Store access layer.
//!
//! This module provides:
//! - `path`: validated slash-delimited node paths
//! - `client`: the store client capability and connector traits
//! - `session`: the connection owner used by every other component
//! - `memory` and `fs`: in-memory and directory-backed backends

pub mod client;
pub mod error;
pub mod fs;
pub mod memory;
pub mod path;
pub mod session;

pub use client::{
    AclEntry, NodeStat, StoreClient, StoreConnector, WatchCallback, WatchEventType,
};
pub use error::{StoreError, StoreResult};
pub use fs::{FsConnector, FsStore};
pub use memory::MemoryStore;
pub use path::NodePath;
pub use session::StoreSession;
