//! Serialized commit pipeline.
//!
//! Every commit submitted to a broker is queued to one task, which drives
//! the three commit phases for one transaction at a time. That task marks
//! itself with a task-local pipeline id; a [`CommitHandle`] awaited or
//! waited on from inside its own pipeline fails with `WouldDeadlock` instead
//! of hanging.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::{Result, StoreError};
use crate::store::{StoreCommitCohort, ThreePhaseCommitCohort};

use super::CommitInfo;

tokio::task_local! {
    static COMMIT_PIPELINE: u64;
}

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

fn in_pipeline(id: u64) -> bool {
    COMMIT_PIPELINE
        .try_with(|current| *current == id)
        .unwrap_or(false)
}

/// Callback run by the pipeline once a commit finished, before its handle resolves.
pub(crate) type CompletionHook = Box<dyn FnOnce(&Result<CommitInfo>) + Send>;

pub(crate) struct CommitRequest {
    tx_id: String,
    stores: Vec<StoreCommitCohort>,
    external: Vec<Box<dyn ThreePhaseCommitCohort>>,
    on_complete: Option<CompletionHook>,
    responder: oneshot::Sender<Result<CommitInfo>>,
}

pub(crate) struct CommitPipeline {
    id: u64,
    sender: mpsc::Sender<CommitRequest>,
}

impl CommitPipeline {
    pub(crate) fn start(handle: &Handle, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
        handle.spawn(COMMIT_PIPELINE.scope(id, run(id, receiver)));
        Self { id, sender }
    }

    /// Fail a transaction without running any phase.
    pub(crate) fn reject(
        &self,
        tx_id: String,
        stores: &[StoreCommitCohort],
        on_complete: Option<CompletionHook>,
        cause: StoreError,
    ) -> CommitHandle {
        fail_stores(stores, &cause);
        let result = Err(cause);
        if let Some(hook) = on_complete {
            hook(&result);
        }
        CommitHandle::done(tx_id, self.id, result)
    }

    pub(crate) fn submit(
        &self,
        tx_id: String,
        stores: Vec<StoreCommitCohort>,
        external: Vec<Box<dyn ThreePhaseCommitCohort>>,
        on_complete: Option<CompletionHook>,
    ) -> CommitHandle {
        let (responder, receiver) = oneshot::channel();
        let request = CommitRequest {
            tx_id: tx_id.clone(),
            stores,
            external,
            on_complete,
            responder,
        };
        match self.sender.try_send(request) {
            Ok(()) => {
                trace!(tx = %tx_id, pipeline = self.id, "queued commit");
                CommitHandle {
                    tx_id,
                    pipeline: self.id,
                    state: HandleState::Pending(receiver),
                }
            }
            Err(TrySendError::Full(request)) => {
                warn!(tx = %tx_id, pipeline = self.id, "commit queue full, rejecting transaction");
                self.reject(
                    tx_id.clone(),
                    &request.stores,
                    request.on_complete,
                    StoreError::CommitQueueFull(tx_id),
                )
            }
            Err(TrySendError::Closed(request)) => {
                self.reject(tx_id, &request.stores, request.on_complete, StoreError::PipelineClosed)
            }
        }
    }
}

async fn run(id: u64, mut receiver: mpsc::Receiver<CommitRequest>) {
    debug!(pipeline = id, "commit pipeline started");
    while let Some(request) = receiver.recv().await {
        let CommitRequest {
            tx_id,
            stores,
            external,
            on_complete,
            responder,
        } = request;

        let result = execute(&tx_id, &stores, &external).await;
        if let Some(hook) = on_complete {
            hook(&result);
        }
        if responder.send(result).is_err() {
            trace!(tx = %tx_id, "commit handle dropped before completion");
        }
    }
    debug!(pipeline = id, "commit pipeline stopped");
}

async fn execute(
    tx_id: &str,
    stores: &[StoreCommitCohort],
    external: &[Box<dyn ThreePhaseCommitCohort>],
) -> Result<CommitInfo> {
    let cohorts: Vec<&dyn ThreePhaseCommitCohort> = stores
        .iter()
        .map(|c| c as &dyn ThreePhaseCommitCohort)
        .chain(external.iter().map(|c| c.as_ref()))
        .collect();

    // Phase 1
    trace!(tx = %tx_id, cohorts = cohorts.len(), "canCommit");
    let votes = join_all(cohorts.iter().map(|c| c.can_commit())).await;
    let mut veto = None;
    for vote in votes {
        match vote {
            Ok(true) => {}
            Ok(false) => {
                veto.get_or_insert_with(|| StoreError::CommitRejected(tx_id.to_string()));
            }
            Err(e) => {
                veto.get_or_insert(e);
            }
        }
    }
    if let Some(cause) = veto {
        warn!(tx = %tx_id, error = %cause, "transaction rejected in canCommit");
        fail_stores(stores, &cause);
        abort_all(tx_id, &cohorts).await;
        return Err(cause);
    }

    // Phase 2
    trace!(tx = %tx_id, "preCommit");
    let prepared = join_all(cohorts.iter().map(|c| c.pre_commit())).await;
    if let Some(cause) = prepared.into_iter().find_map(Result::err) {
        warn!(tx = %tx_id, error = %cause, "transaction failed in preCommit");
        fail_stores(stores, &cause);
        abort_all(tx_id, &cohorts).await;
        return Err(cause);
    }

    // Phase 3
    trace!(tx = %tx_id, "commit");
    for (index, cohort) in cohorts.iter().enumerate() {
        if let Err(cause) = cohort.commit().await {
            error!(
                tx = %tx_id,
                error = %cause,
                committed = index,
                total = cohorts.len(),
                "commit failed after preCommit, participants may be partially committed"
            );
            abort_all(tx_id, &cohorts[index + 1..]).await;
            return Err(StoreError::PartialCommit {
                tx: tx_id.to_string(),
                cause: cause.to_string(),
            });
        }
    }

    let versions = stores
        .iter()
        .filter_map(|c| c.committed_version().map(|v| (c.datastore_type(), v)))
        .collect();
    debug!(tx = %tx_id, "transaction committed");
    Ok(CommitInfo {
        tx_id: tx_id.to_string(),
        versions,
        committed_at: Utc::now(),
    })
}

fn fail_stores(stores: &[StoreCommitCohort], cause: &StoreError) {
    for cohort in stores {
        cohort.fail(cause);
    }
}

async fn abort_all(tx_id: &str, cohorts: &[&dyn ThreePhaseCommitCohort]) {
    for result in join_all(cohorts.iter().map(|c| c.abort())).await {
        if let Err(e) = result {
            warn!(tx = %tx_id, error = %e, "abort failed");
        }
    }
}

enum HandleState {
    Pending(oneshot::Receiver<Result<CommitInfo>>),
    Done(Option<Result<CommitInfo>>),
}

/// Result handle of a submitted transaction.
///
/// Resolves once the transaction committed or failed. Await it from async
/// code or call [`CommitHandle::wait`] from synchronous code.
pub struct CommitHandle {
    tx_id: String,
    pipeline: u64,
    state: HandleState,
}

impl CommitHandle {
    fn done(tx_id: String, pipeline: u64, result: Result<CommitInfo>) -> Self {
        Self {
            tx_id,
            pipeline,
            state: HandleState::Done(Some(result)),
        }
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Block the current thread until the commit finished.
    ///
    /// Must not be called on a single-threaded runtime's only thread. Called
    /// from inside the commit pipeline it fails with `WouldDeadlock`.
    pub fn wait(self) -> Result<CommitInfo> {
        if in_pipeline(self.pipeline) {
            return Err(StoreError::WouldDeadlock(self.tx_id));
        }
        futures::executor::block_on(self)
    }
}

impl Future for CommitHandle {
    type Output = Result<CommitInfo>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if in_pipeline(this.pipeline) {
            return Poll::Ready(Err(StoreError::WouldDeadlock(this.tx_id.clone())));
        }
        match &mut this.state {
            HandleState::Done(result) => {
                Poll::Ready(result.take().unwrap_or(Err(StoreError::PipelineClosed)))
            }
            HandleState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::PipelineClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHandle")
            .field("tx_id", &self.tx_id)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
