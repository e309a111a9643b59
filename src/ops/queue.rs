//! Operation queue feeding completions back to the interactive loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::store::{AclEntry, NodePath, NodeStat, StoreError, StoreResult, StoreSession};
use crate::tree::{RefreshedTree, TreeCache};
use crate::ui::scheduler::Interactive;

/// What a pending operation does; used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Delete,
    SetData,
    GetData,
    Create,
    FetchAcl,
    Refresh,
}

/// A deferred unit of work and the handler that receives its outcome.
pub struct PendingOperation<S, T> {
    kind: OperationKind,
    work: Box<dyn FnOnce(&StoreSession, &Arc<TreeCache>) -> StoreResult<T> + Send>,
    on_complete: Box<dyn FnOnce(&mut S, StoreResult<T>) + Send>,
}

impl<S, T> PendingOperation<S, T> {
    /// Pair `work`, run on a worker thread, with `on_complete`, run on the
    /// interactive loop with the outcome.
    pub fn new(
        kind: OperationKind,
        work: impl FnOnce(&StoreSession, &Arc<TreeCache>) -> StoreResult<T> + Send + 'static,
        on_complete: impl FnOnce(&mut S, StoreResult<T>) + Send + 'static,
    ) -> Self {
        Self {
            kind,
            work: Box::new(work),
            on_complete: Box::new(on_complete),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

/// What happened to one path of a delete batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Failed(StoreError),
    /// An earlier path failed, so this one was never tried.
    NotAttempted,
}

/// Per-path outcomes of a delete batch, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub outcomes: Vec<(NodePath, DeleteOutcome)>,
}

impl DeleteReport {
    fn aborted(paths: Vec<NodePath>, error: StoreError) -> Self {
        let mut outcomes: Vec<_> = paths
            .into_iter()
            .map(|p| (p, DeleteOutcome::NotAttempted))
            .collect();
        if let Some(first) = outcomes.first_mut() {
            first.1 = DeleteOutcome::Failed(error);
        }
        Self { outcomes }
    }

    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| *o == DeleteOutcome::Deleted)
    }

    pub fn deleted(&self) -> Vec<&NodePath> {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == DeleteOutcome::Deleted)
            .map(|(p, _)| p)
            .collect()
    }

    /// The path that stopped the batch, if any.
    pub fn failure(&self) -> Option<(&NodePath, &StoreError)> {
        self.outcomes.iter().find_map(|(p, o)| match o {
            DeleteOutcome::Failed(e) => Some((p, e)),
            _ => None,
        })
    }
}

/// Runs node operations off the interactive thread.
///
/// `S` is the state owned by the interactive loop that completion handlers
/// receive.
pub struct NodeOperationQueue<S> {
    session: Arc<StoreSession>,
    cache: Arc<TreeCache>,
    ui: Interactive<S>,
    next_id: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl<S: 'static> NodeOperationQueue<S> {
    /// Create a queue working against `cache`'s session.
    ///
    /// # Arguments
    /// * `cache` - Tree cache whose session every operation uses
    /// * `ui` - Handle for posting completions to the interactive loop
    pub fn new(cache: Arc<TreeCache>, ui: Interactive<S>) -> Self {
        Self {
            session: Arc::clone(cache.session()),
            cache,
            ui,
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Operations submitted but whose handlers have not been queued yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `op` on a worker thread and post its outcome to the interactive loop.
    pub fn submit<T: Send + 'static>(&self, op: PendingOperation<S, T>) -> JoinHandle<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let PendingOperation {
            kind,
            work,
            on_complete,
        } = op;
        let session = Arc::clone(&self.session);
        let cache = Arc::clone(&self.cache);
        let ui = self.ui.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Operation #{} ({:?}) queued", id, kind);

        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || work(&session, &cache))
                .await
                .unwrap_or_else(|e| {
                    Err(StoreError::OperationFailed(format!("{kind:?} task failed: {e}")))
                });
            match &outcome {
                Ok(_) => tracing::debug!("Operation #{} ({:?}) finished", id, kind),
                Err(e) => tracing::warn!("Operation #{} ({:?}) failed: {}", id, kind, e),
            }
            if !ui.post(move |state| on_complete(state, outcome)) {
                tracing::debug!("Interactive loop gone, dropping outcome of #{}", id);
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Delete each path (with its descendants) in order, stopping at the
    /// first failure. Earlier deletions are not rolled back.
    pub fn delete(
        &self,
        paths: Vec<NodePath>,
        on_complete: impl FnOnce(&mut S, DeleteReport) + Send + 'static,
    ) -> JoinHandle<()> {
        let submitted = paths.clone();
        self.submit(PendingOperation::new(
            OperationKind::Delete,
            move |session, _| Ok(delete_in_order(session, paths)),
            move |state, outcome: StoreResult<DeleteReport>| {
                let report = outcome.unwrap_or_else(|e| DeleteReport::aborted(submitted, e));
                on_complete(state, report)
            },
        ))
    }

    /// Replace the payload of `path`.
    pub fn set_data(
        &self,
        path: NodePath,
        data: Vec<u8>,
        on_complete: impl FnOnce(&mut S, StoreResult<NodeStat>) + Send + 'static,
    ) -> JoinHandle<()> {
        self.submit(PendingOperation::new(
            OperationKind::SetData,
            move |session, _| session.set_data(&path, &data),
            on_complete,
        ))
    }

    /// Read the payload of `path`.
    pub fn get_data(
        &self,
        path: NodePath,
        on_complete: impl FnOnce(&mut S, StoreResult<Vec<u8>>) + Send + 'static,
    ) -> JoinHandle<()> {
        self.submit(PendingOperation::new(
            OperationKind::GetData,
            move |session, _| session.get_data(&path),
            on_complete,
        ))
    }

    /// Create `name` under `parent`; the outcome carries the new path.
    pub fn create(
        &self,
        parent: NodePath,
        name: String,
        on_complete: impl FnOnce(&mut S, StoreResult<NodePath>) + Send + 'static,
    ) -> JoinHandle<()> {
        self.submit(PendingOperation::new(
            OperationKind::Create,
            move |session, _| session.create_node(&parent, &name),
            on_complete,
        ))
    }

    pub fn fetch_acl(
        &self,
        path: NodePath,
        on_complete: impl FnOnce(&mut S, StoreResult<Vec<AclEntry>>) + Send + 'static,
    ) -> JoinHandle<()> {
        self.submit(PendingOperation::new(
            OperationKind::FetchAcl,
            move |session, _| session.get_acl(&path),
            on_complete,
        ))
    }

    /// Refresh the tree cache and re-fetch the given expanded paths.
    pub fn refresh(
        &self,
        expanded: HashSet<NodePath>,
        selected: HashSet<NodePath>,
        on_complete: impl FnOnce(&mut S, StoreResult<RefreshedTree>) + Send + 'static,
    ) -> JoinHandle<()> {
        self.submit(PendingOperation::new(
            OperationKind::Refresh,
            move |_, cache| cache.refresh_restoring(&expanded, &selected),
            on_complete,
        ))
    }
}

fn delete_in_order(session: &StoreSession, paths: Vec<NodePath>) -> DeleteReport {
    let mut outcomes = Vec::with_capacity(paths.len());
    let mut failed = false;
    for path in paths {
        if failed {
            outcomes.push((path, DeleteOutcome::NotAttempted));
            continue;
        }
        match session.delete_node(&path) {
            Ok(()) => outcomes.push((path, DeleteOutcome::Deleted)),
            Err(e) => {
                tracing::warn!("Delete of {} failed: {}", path, e);
                failed = true;
                outcomes.push((path, DeleteOutcome::Failed(e)));
            }
        }
    }
    DeleteReport { outcomes }
}
