//! Background node operations.
//!
//! `NodeOperationQueue` runs mutating and long-running reads on worker
//! threads and delivers each outcome to a completion handler on the
//! interactive thread. Independent operations may run in parallel; the
//! paths of one delete batch are processed strictly in order. Nothing is
//! retried.

pub mod queue;

pub use queue::{DeleteOutcome, DeleteReport, NodeOperationQueue, OperationKind, PendingOperation};
