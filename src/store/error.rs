//! Error taxonomy shared by the session, tree cache and operation queue.

use thiserror::Error;

/// Errors that can occur while talking to the remote store.
///
/// Every variant is cheap to clone so a single failure can be reported to
/// several completion handlers (for example one per path of a batch delete).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No live session; the network was not touched.
    #[error("not connected to a store")]
    NotConnected,

    #[error("store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("failed to re-arm watch on {path}: {reason}")]
    WatchRearmFailed { path: String, reason: String },

    #[error("invalid node path {0:?}")]
    InvalidPath(String),
}

impl StoreError {
    /// True for failures that mean the node is simply gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NodeNotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
