//! Three-phase commit cohort of a store transaction.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Result, StoreError};
use crate::tree::{DataTreeCandidate, PreparedCommit, ValidationContext};

use super::chain::ChainShared;
use super::{LogicalDatastoreType, StoreInner};

/// A participant in a three-phase commit.
#[async_trait]
pub trait ThreePhaseCommitCohort: Send + Sync {
    /// Vote on the commit. `Ok(false)` or an error vetoes it.
    async fn can_commit(&self) -> Result<bool>;

    /// Prepare to finalize.
    async fn pre_commit(&self) -> Result<()>;

    /// Make the change visible.
    async fn commit(&self) -> Result<()>;

    /// Discard the change.
    async fn abort(&self) -> Result<()>;
}

/// Final state of a readied transaction, shared with its chain.
#[derive(Debug, Default)]
pub(crate) struct TxOutcome {
    state: Mutex<Outcome>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    #[default]
    Pending,
    Committed,
    Failed,
}

impl TxOutcome {
    pub(crate) fn is_pending(&self) -> bool {
        *self.state.lock() == Outcome::Pending
    }

    fn set(&self, outcome: Outcome) {
        *self.state.lock() = outcome;
    }
}

enum Phase {
    Ready,
    CanCommit,
    PreCommitted(PreparedCommit),
    Committed(u64),
    Aborted,
}

/// Cohort driving one readied store transaction through commit.
pub struct StoreCommitCohort {
    tx_id: String,
    store: Arc<StoreInner>,
    candidate: DataTreeCandidate,
    chain: Option<Arc<ChainShared>>,
    outcome: Arc<TxOutcome>,
    phase: Mutex<Phase>,
}

impl StoreCommitCohort {
    pub(crate) fn new(
        tx_id: String,
        store: Arc<StoreInner>,
        candidate: DataTreeCandidate,
        chain: Option<Arc<ChainShared>>,
        outcome: Arc<TxOutcome>,
    ) -> Self {
        Self {
            tx_id,
            store,
            candidate,
            chain,
            outcome,
            phase: Mutex::new(Phase::Ready),
        }
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    pub fn datastore_type(&self) -> LogicalDatastoreType {
        self.store.datastore_type
    }

    /// Changes relative to the transaction's base snapshot.
    pub fn candidate(&self) -> &DataTreeCandidate {
        &self.candidate
    }

    pub(crate) fn validation_context(&self) -> Arc<Box<dyn ValidationContext>> {
        self.store.tree.validation_context()
    }

    /// Store version produced by this transaction, once committed.
    pub fn committed_version(&self) -> Option<u64> {
        match &*self.phase.lock() {
            Phase::Committed(version) => Some(*version),
            _ => None,
        }
    }

    /// Record a failure that happened outside the cohort's own phases.
    pub(crate) fn fail(&self, cause: &StoreError) {
        self.outcome.set(Outcome::Failed);
        if let Some(chain) = &self.chain {
            chain.transaction_failed(&self.tx_id, cause);
        }
    }
}

#[async_trait]
impl ThreePhaseCommitCohort for StoreCommitCohort {
    async fn can_commit(&self) -> Result<bool> {
        if let Some(chain) = &self.chain {
            chain.ensure_usable()?;
        }
        match self.store.tree.validate(&self.candidate) {
            Ok(()) => {
                *self.phase.lock() = Phase::CanCommit;
                trace!(tx = %self.tx_id, store = %self.store.name, "canCommit succeeded");
                Ok(true)
            }
            Err(e) => {
                warn!(tx = %self.tx_id, store = %self.store.name, error = %e, "canCommit failed");
                Err(e)
            }
        }
    }

    async fn pre_commit(&self) -> Result<()> {
        let prepared = self.store.tree.prepare(&self.candidate).inspect_err(|e| {
            warn!(tx = %self.tx_id, store = %self.store.name, error = %e, "preCommit failed");
        })?;
        *self.phase.lock() = Phase::PreCommitted(prepared);
        trace!(tx = %self.tx_id, store = %self.store.name, "preCommit succeeded");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let prepared = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, Phase::Aborted) {
                Phase::PreCommitted(prepared) => prepared,
                other => {
                    *phase = other;
                    return Err(StoreError::IllegalState(format!(
                        "transaction {} was not pre-committed",
                        self.tx_id
                    )));
                }
            }
        };

        let store = &self.store;
        match store
            .notifications
            .commit_and_publish(|| store.tree.commit(prepared))
        {
            Ok(result) => {
                let version = result.snapshot.version();
                *self.phase.lock() = Phase::Committed(version);
                self.outcome.set(Outcome::Committed);
                debug!(tx = %self.tx_id, store = %store.name, version, "transaction committed");
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn abort(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Committed(_)) {
                return Err(StoreError::IllegalState(format!(
                    "transaction {} is already committed",
                    self.tx_id
                )));
            }
            *phase = Phase::Aborted;
        }
        self.fail(&StoreError::CommitRejected(self.tx_id.clone()));
        debug!(tx = %self.tx_id, store = %self.store.name, "transaction aborted");
        Ok(())
    }
}

impl std::fmt::Debug for StoreCommitCohort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCommitCohort")
            .field("tx_id", &self.tx_id)
            .field("store", &self.store.name)
            .finish()
    }
}
