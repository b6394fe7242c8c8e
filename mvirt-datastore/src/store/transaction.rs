//! Store transactions.
//!
//! Read-only transactions wrap a snapshot. Write and read-write transactions
//! wrap a modification and turn into a [`StoreCommitCohort`] once readied.
//! Dropping an open write transaction cancels it.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::tree::{DataTreeModification, DataTreeSnapshot, Node, Path};

use super::chain::ChainShared;
use super::cohort::{StoreCommitCohort, TxOutcome};
use super::StoreInner;

/// Read-only transaction over one snapshot.
pub struct ReadOnlyTransaction {
    id: String,
    snapshot: Option<DataTreeSnapshot>,
}

impl ReadOnlyTransaction {
    pub(crate) fn new(id: String, snapshot: DataTreeSnapshot) -> Self {
        trace!(tx = %id, version = snapshot.version(), "allocated read-only transaction");
        Self {
            id,
            snapshot: Some(snapshot),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the node at `path`.
    pub async fn read(&self, path: &Path) -> Result<Option<Node>> {
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| StoreError::ReadFailed(format!("transaction {} is closed", self.id)))?;
        let path = snapshot.normalize_path(path)?;
        Ok(snapshot.read(&path))
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.read(path).await?.is_some())
    }

    /// Release the snapshot. Further reads fail.
    pub fn close(&mut self) {
        if self.snapshot.take().is_some() {
            trace!(tx = %self.id, "closed read-only transaction");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.snapshot.is_none()
    }
}

enum TxState {
    Open(DataTreeModification),
    Ready,
    Cancelled,
}

/// State shared by write and read-write transactions.
struct TxCore {
    id: String,
    store: Arc<StoreInner>,
    state: TxState,
    chain: Option<Arc<ChainShared>>,
}

impl TxCore {
    fn new(
        id: String,
        store: Arc<StoreInner>,
        snapshot: DataTreeSnapshot,
        chain: Option<Arc<ChainShared>>,
    ) -> Self {
        trace!(tx = %id, store = %store.name, version = snapshot.version(), "allocated write transaction");
        Self {
            id,
            store,
            state: TxState::Open(snapshot.new_modification()),
            chain,
        }
    }

    fn modification(&mut self) -> Result<&mut DataTreeModification> {
        match &mut self.state {
            TxState::Open(modification) => Ok(modification),
            TxState::Ready => Err(StoreError::TransactionSealed(self.id.clone())),
            TxState::Cancelled => Err(StoreError::TransactionClosed(self.id.clone())),
        }
    }

    fn read(&self, path: &Path) -> Result<Option<Node>> {
        match &self.state {
            TxState::Open(modification) => modification.read(path),
            _ => Err(StoreError::ReadFailed(format!(
                "transaction {} is closed",
                self.id
            ))),
        }
    }

    fn ready(&mut self) -> Result<StoreCommitCohort> {
        let mut modification = match std::mem::replace(&mut self.state, TxState::Ready) {
            TxState::Open(modification) => modification,
            TxState::Ready => return Err(StoreError::TransactionSealed(self.id.clone())),
            TxState::Cancelled => {
                self.state = TxState::Cancelled;
                return Err(StoreError::TransactionClosed(self.id.clone()));
            }
        };
        let candidate = modification.ready()?;
        let outcome = Arc::new(TxOutcome::default());
        if let Some(chain) = &self.chain {
            chain.transaction_ready(&self.id, modification.snapshot(), outcome.clone());
        }
        debug!(
            tx = %self.id,
            store = %self.store.name,
            operations = modification.operation_count(),
            "transaction ready"
        );
        Ok(StoreCommitCohort::new(
            self.id.clone(),
            self.store.clone(),
            candidate,
            self.chain.clone(),
            outcome,
        ))
    }

    fn cancel(&mut self) -> bool {
        if !matches!(self.state, TxState::Open(_)) {
            return false;
        }
        self.state = TxState::Cancelled;
        if let Some(chain) = &self.chain {
            chain.transaction_cancelled(&self.id);
        }
        debug!(tx = %self.id, store = %self.store.name, "transaction cancelled");
        true
    }
}

impl Drop for TxCore {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Write-only transaction.
pub struct WriteTransaction {
    core: TxCore,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("id", &self.core.id)
            .finish()
    }
}

impl WriteTransaction {
    pub(crate) fn new(
        id: String,
        store: Arc<StoreInner>,
        snapshot: DataTreeSnapshot,
        chain: Option<Arc<ChainShared>>,
    ) -> Self {
        Self {
            core: TxCore::new(id, store, snapshot, chain),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn write(&mut self, path: &Path, node: Node) -> Result<()> {
        self.core.modification()?.write(path, node)
    }

    pub fn merge(&mut self, path: &Path, node: Node) -> Result<()> {
        self.core.modification()?.merge(path, node)
    }

    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.core.modification()?.delete(path)
    }

    /// Seal the transaction and hand it over to a commit cohort.
    pub fn ready(&mut self) -> Result<StoreCommitCohort> {
        self.core.ready()
    }

    /// Discard the transaction. Returns false if it was already readied or cancelled.
    pub fn cancel(&mut self) -> bool {
        self.core.cancel()
    }
}

/// Read-write transaction. Reads observe the transaction's own writes.
pub struct ReadWriteTransaction {
    core: TxCore,
}

impl std::fmt::Debug for ReadWriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteTransaction")
            .field("id", &self.core.id)
            .finish()
    }
}

impl ReadWriteTransaction {
    pub(crate) fn new(
        id: String,
        store: Arc<StoreInner>,
        snapshot: DataTreeSnapshot,
        chain: Option<Arc<ChainShared>>,
    ) -> Self {
        Self {
            core: TxCore::new(id, store, snapshot, chain),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub async fn read(&self, path: &Path) -> Result<Option<Node>> {
        self.core.read(path)
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.core.read(path)?.is_some())
    }

    pub fn write(&mut self, path: &Path, node: Node) -> Result<()> {
        self.core.modification()?.write(path, node)
    }

    pub fn merge(&mut self, path: &Path, node: Node) -> Result<()> {
        self.core.modification()?.merge(path, node)
    }

    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.core.modification()?.delete(path)
    }

    pub fn ready(&mut self) -> Result<StoreCommitCohort> {
        self.core.ready()
    }

    pub fn cancel(&mut self) -> bool {
        self.core.cancel()
    }
}
