//! Delivery of change events to registered listeners.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::store::{NodePath, WatchEventType};

/// A change observed on a watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: NodePath,
    pub event_type: WatchEventType,
    /// Diagnostic fields such as the node's new version or mtime.
    pub attributes: BTreeMap<String, String>,
}

impl ChangeEvent {
    pub fn new(path: NodePath, event_type: WatchEventType) -> Self {
        Self {
            path,
            event_type,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Receives change events for the paths it is registered on.
///
/// Called off the interactive thread. Listeners that touch UI state must
/// marshal onto the interactive scheduler themselves.
pub trait NodeListener: Send + Sync {
    fn process_event(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

impl<F> NodeListener for F
where
    F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn process_event(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Calls every listener once per event, isolating failures.
pub struct ChangeEventFanout {
    sender: broadcast::Sender<ChangeEvent>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl ChangeEventFanout {
    /// `buffer_size` bounds the broadcast mirror used by [`subscribe`](Self::subscribe).
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            sender,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Receive a copy of every dispatched event.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to each listener in order. A listener that errors or
    /// panics is logged and skipped. Returns the number of successful
    /// deliveries.
    pub fn dispatch(&self, event: &ChangeEvent, listeners: &[Arc<dyn NodeListener>]) -> usize {
        let mut ok = 0;
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.process_event(event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => {
                    tracing::warn!("Listener failed on {} {}: {:#}", event.path, event.event_type, e);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    tracing::error!("Listener panicked on {} {}", event.path, event.event_type);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.delivered.fetch_add(ok as u64, Ordering::Relaxed);

        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
        ok
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Default for ChangeEventFanout {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> ChangeEvent {
        ChangeEvent::new(NodePath::new("/x").unwrap(), WatchEventType::NodeDataChanged)
    }

    #[test]
    fn test_bad_listener_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let last = Arc::clone(&seen);
        let listeners: Vec<Arc<dyn NodeListener>> = vec![
            Arc::new(move |_: &ChangeEvent| -> anyhow::Result<()> {
                first.lock().unwrap().push("first");
                Ok(())
            }),
            Arc::new(|_: &ChangeEvent| -> anyhow::Result<()> { anyhow::bail!("broken listener") }),
            Arc::new(|_: &ChangeEvent| -> anyhow::Result<()> { panic!("boom") }),
            Arc::new(move |_: &ChangeEvent| -> anyhow::Result<()> {
                last.lock().unwrap().push("last");
                Ok(())
            }),
        ];

        let fanout = ChangeEventFanout::default();
        assert_eq!(fanout.dispatch(&event(), &listeners), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "last"]);
        assert_eq!(fanout.failed(), 2);
        assert_eq!(fanout.delivered(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_get_a_copy() {
        let fanout = ChangeEventFanout::new(4);
        let mut rx = fanout.subscribe();
        fanout.dispatch(&event(), &[]);
        let got = rx.recv().await.unwrap();
        assert_eq!(got, event());
    }
}
