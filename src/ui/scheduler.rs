//! Interactive-thread scheduling.
//!
//! The interactive side owns its state `S` inside an [`InteractiveLoop`].
//! Everything else talks to it by posting tasks through an [`Interactive`]
//! handle; a task runs with `&mut S` on whichever thread drives the loop.
//! Background results always cross over as a posted task, never as a write
//! into shared state.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of work for the interactive thread.
pub type UiTask<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Handle for posting work to the interactive loop.
pub struct Interactive<S> {
    tx: mpsc::UnboundedSender<UiTask<S>>,
}

impl<S> Clone for Interactive<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> Interactive<S> {
    /// Queue `task` for the interactive thread. Returns `false` once the
    /// loop has shut down.
    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Run blocking `work` on a worker thread, then hand its value to `done`
    /// on the interactive thread.
    pub fn run_in_background<T, W, D>(&self, label: &'static str, work: W, done: D) -> JoinHandle<()>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(&mut S, T) + Send + 'static,
    {
        let ui = self.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(value) => {
                    if !ui.post(move |state| done(state, value)) {
                        tracing::debug!("Interactive loop gone, dropping result of {}", label);
                    }
                }
                Err(e) => tracing::error!("Background task {} failed: {}", label, e),
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The interactive loop and the state it owns.
pub struct InteractiveLoop<S> {
    rx: mpsc::UnboundedReceiver<UiTask<S>>,
    state: S,
}

impl<S: 'static> InteractiveLoop<S> {
    pub fn new(state: S) -> (Self, Interactive<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, state }, Interactive { tx })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Run every task already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task(&mut self.state);
            ran += 1;
        }
        ran
    }

    /// Wait for one task and run it. Returns `false` once every handle is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task(&mut self.state);
                true
            }
            None => false,
        }
    }

    /// Run tasks until `done` holds for the state or `timeout` elapses.
    pub async fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&S) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !done(&self.state) {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(task)) => task(&mut self.state),
                Ok(None) | Err(_) => return done(&self.state),
            }
        }
        true
    }

    /// Run until every [`Interactive`] handle has been dropped.
    pub async fn run(mut self) -> S {
        while self.run_next().await {}
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_posted_tasks_run_in_order() {
        let (mut ui_loop, ui) = InteractiveLoop::new(Vec::<u32>::new());
        ui.post(|s| s.push(1));
        ui.post(|s| s.push(2));
        assert!(ui_loop.state().is_empty());
        assert_eq!(ui_loop.run_pending(), 2);
        assert_eq!(ui_loop.state(), &vec![1, 2]);
    }

    #[tokio::test]
    async fn test_background_result_lands_on_loop() {
        let (mut ui_loop, ui) = InteractiveLoop::new(0u64);
        ui.run_in_background("sum", || (1..=10u64).sum::<u64>(), |s, v| *s = v);
        assert!(ui_loop.run_until(Duration::from_secs(2), |s| *s == 55).await);
    }

    #[tokio::test]
    async fn test_run_returns_state_when_handles_drop() {
        let (ui_loop, ui) = InteractiveLoop::new(String::new());
        ui.post(|s| s.push_str("done"));
        drop(ui);
        assert_eq!(ui_loop.run().await, "done");
    }
}
