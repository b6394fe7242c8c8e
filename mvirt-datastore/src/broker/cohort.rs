//! Externally registered commit cohorts.
//!
//! A [`DataTreeCommitCohort`] registered at a store path takes part in every
//! commit whose candidate touches that path. Its `can_commit` vote returns a
//! [`CommitStep`] that is then driven through the remaining phases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::store::{LogicalDatastoreType, ThreePhaseCommitCohort};
use crate::tree::{DataTreeCandidate, Path, ValidationContext};

/// A participant validating commits below a registered path.
#[async_trait]
pub trait DataTreeCommitCohort: Send + Sync + 'static {
    /// Inspect the changes under the registered path and vote.
    ///
    /// Returning an error vetoes the transaction; the error is reported to
    /// the submitter unchanged.
    async fn can_commit(
        &self,
        tx_id: &str,
        candidates: &[DataTreeCandidate],
        context: &dyn ValidationContext,
    ) -> Result<Box<dyn CommitStep>>;
}

/// Remaining phases of an accepted vote.
#[async_trait]
pub trait CommitStep: Send + Sync {
    async fn pre_commit(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        Ok(())
    }
}

/// Step for cohorts with nothing to do after voting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommitStep;

impl CommitStep for NoopCommitStep {}

struct CohortEntry {
    id: u64,
    store: LogicalDatastoreType,
    path: Path,
    cohort: Arc<dyn DataTreeCommitCohort>,
}

#[derive(Default)]
pub(crate) struct CohortRegistry {
    entries: RwLock<Vec<CohortEntry>>,
    next_id: AtomicU64,
}

impl CohortRegistry {
    pub(crate) fn register(
        self: &Arc<Self>,
        store: LogicalDatastoreType,
        path: Path,
        cohort: Arc<dyn DataTreeCommitCohort>,
    ) -> CommitCohortRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, %store, %path, "registered commit cohort");
        self.entries.write().push(CohortEntry {
            id,
            store,
            path: path.clone(),
            cohort,
        });
        CommitCohortRegistration {
            id,
            store,
            path,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Cohorts whose registered path is touched by `candidate`.
    pub(crate) fn cohorts_for(
        &self,
        tx_id: &str,
        store: LogicalDatastoreType,
        candidate: &DataTreeCandidate,
        context: Arc<Box<dyn ValidationContext>>,
    ) -> Vec<Box<dyn ThreePhaseCommitCohort>> {
        let entries = self.entries.read();
        let mut cohorts: Vec<Box<dyn ThreePhaseCommitCohort>> = Vec::new();
        for entry in entries.iter().filter(|e| e.store == store) {
            let candidates = candidate.matching(&entry.path);
            if candidates.is_empty() {
                continue;
            }
            trace!(tx = %tx_id, cohort = entry.id, path = %entry.path, "cohort joins commit");
            cohorts.push(Box::new(ExternalCohort {
                tx_id: tx_id.to_string(),
                cohort: entry.cohort.clone(),
                candidates,
                context: context.clone(),
                step: Mutex::new(None),
            }));
        }
        cohorts
    }
}

/// Handle of a registered commit cohort. Dropping it unregisters the cohort.
pub struct CommitCohortRegistration {
    id: u64,
    store: LogicalDatastoreType,
    path: Path,
    registry: Weak<CohortRegistry>,
}

impl CommitCohortRegistration {
    pub fn store(&self) -> LogicalDatastoreType {
        self.store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unregister the cohort. Commits queued after this call no longer consult it.
    pub fn close(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(id = self.id, path = %self.path, "unregistered commit cohort");
            }
        }
    }
}

impl Drop for CommitCohortRegistration {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CommitCohortRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCohortRegistration")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("path", &self.path)
            .finish()
    }
}

/// Adapts a registered cohort to the commit protocol for one transaction.
struct ExternalCohort {
    tx_id: String,
    cohort: Arc<dyn DataTreeCommitCohort>,
    candidates: Vec<DataTreeCandidate>,
    context: Arc<Box<dyn ValidationContext>>,
    step: Mutex<Option<Arc<dyn CommitStep>>>,
}

impl ExternalCohort {
    fn step(&self) -> Result<Arc<dyn CommitStep>> {
        self.step.lock().clone().ok_or_else(|| {
            StoreError::IllegalState(format!(
                "commit cohort for transaction {} has not voted",
                self.tx_id
            ))
        })
    }
}

#[async_trait]
impl ThreePhaseCommitCohort for ExternalCohort {
    async fn can_commit(&self) -> Result<bool> {
        let step = self
            .cohort
            .can_commit(&self.tx_id, &self.candidates, &**self.context)
            .await?;
        *self.step.lock() = Some(Arc::from(step));
        Ok(true)
    }

    async fn pre_commit(&self) -> Result<()> {
        self.step()?.pre_commit().await
    }

    async fn commit(&self) -> Result<()> {
        self.step()?.commit().await
    }

    async fn abort(&self) -> Result<()> {
        let step = self.step.lock().take();
        match step {
            Some(step) => step.abort().await,
            None => Ok(()),
        }
    }
}
