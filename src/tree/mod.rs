//! Lazily populated tree view over the store.

pub mod cache;

pub use cache::{NodeHandle, RefreshedTree, TreeCache, TreeCacheStats};
