//! Change subscriptions.
//!
//! This module provides:
//! - `registry`: per-path listener sets and one-shot watch re-arming
//! - `fanout`: isolated delivery of change events to listeners

pub mod fanout;
pub mod registry;

pub use fanout::{ChangeEvent, ChangeEventFanout, NodeListener};
pub use registry::{ArmResults, WatchRegistry, WatchState};
