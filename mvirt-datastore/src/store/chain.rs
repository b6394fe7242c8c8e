//! Store transaction chains.
//!
//! A chain allows one open write transaction at a time. A transaction
//! allocated while its predecessor is readied but not yet committed is opened
//! on top of the predecessor's data, so it sees those uncommitted writes. Once
//! any chained transaction fails the chain is unusable.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::tree::DataTreeSnapshot;

use super::cohort::TxOutcome;
use super::transaction::{ReadOnlyTransaction, ReadWriteTransaction, WriteTransaction};
use super::StoreInner;

#[derive(Default)]
struct ChainState {
    open: Option<String>,
    previous: Option<(DataTreeSnapshot, Arc<TxOutcome>)>,
    failed: Option<String>,
    closed: bool,
}

pub(crate) struct ChainShared {
    id: String,
    store: Arc<StoreInner>,
    state: Mutex<ChainState>,
}

impl ChainShared {
    fn check_allocation(&self, state: &ChainState) -> Result<()> {
        if let Some(cause) = &state.failed {
            return Err(StoreError::ChainFailed {
                chain: self.id.clone(),
                cause: cause.clone(),
            });
        }
        if state.closed {
            return Err(StoreError::ChainClosed(self.id.clone()));
        }
        if let Some(open) = &state.open {
            return Err(StoreError::TransactionOpen {
                chain: self.id.clone(),
                open: open.clone(),
            });
        }
        Ok(())
    }

    fn base_snapshot(&self, state: &ChainState) -> DataTreeSnapshot {
        match &state.previous {
            Some((snapshot, outcome)) if outcome.is_pending() => snapshot.clone(),
            _ => self.store.tree.snapshot(),
        }
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match &self.state.lock().failed {
            Some(cause) => Err(StoreError::ChainFailed {
                chain: self.id.clone(),
                cause: cause.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn transaction_ready(
        &self,
        tx_id: &str,
        snapshot: DataTreeSnapshot,
        outcome: Arc<TxOutcome>,
    ) {
        let mut state = self.state.lock();
        if state.open.as_deref() == Some(tx_id) {
            state.open = None;
        }
        state.previous = Some((snapshot, outcome));
    }

    pub(crate) fn transaction_cancelled(&self, tx_id: &str) {
        let mut state = self.state.lock();
        if state.open.as_deref() == Some(tx_id) {
            state.open = None;
        }
    }

    pub(crate) fn transaction_failed(&self, tx_id: &str, cause: &StoreError) {
        let mut state = self.state.lock();
        if state.failed.is_none() {
            warn!(chain = %self.id, tx = %tx_id, error = %cause, "transaction chain failed");
            state.failed = Some(cause.to_string());
        }
    }
}

/// A chain of causally ordered transactions on one store.
pub struct StoreTransactionChain {
    shared: Arc<ChainShared>,
}

impl StoreTransactionChain {
    pub(crate) fn new(id: String, store: Arc<StoreInner>) -> Self {
        debug!(chain = %id, store = %store.name, "created transaction chain");
        Self {
            shared: Arc::new(ChainShared {
                id,
                store,
                state: Mutex::new(ChainState::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Read-only transaction over the chain's latest data. It does not block later allocations.
    pub fn new_read_only_transaction(&self) -> Result<ReadOnlyTransaction> {
        let state = self.shared.state.lock();
        self.shared.check_allocation(&state)?;
        let snapshot = self.shared.base_snapshot(&state);
        Ok(ReadOnlyTransaction::new(
            self.shared.store.next_tx_id(),
            snapshot,
        ))
    }

    pub fn new_write_only_transaction(&self) -> Result<WriteTransaction> {
        let (id, snapshot) = self.allocate()?;
        Ok(WriteTransaction::new(
            id,
            self.shared.store.clone(),
            snapshot,
            Some(self.shared.clone()),
        ))
    }

    pub fn new_read_write_transaction(&self) -> Result<ReadWriteTransaction> {
        let (id, snapshot) = self.allocate()?;
        Ok(ReadWriteTransaction::new(
            id,
            self.shared.store.clone(),
            snapshot,
            Some(self.shared.clone()),
        ))
    }

    fn allocate(&self) -> Result<(String, DataTreeSnapshot)> {
        let mut state = self.shared.state.lock();
        self.shared.check_allocation(&state)?;
        let id = self.shared.store.next_tx_id();
        let snapshot = self.shared.base_snapshot(&state);
        state.open = Some(id.clone());
        Ok((id, snapshot))
    }

    /// Close the chain. Fails if a transaction is still open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(());
        }
        if let Some(open) = &state.open {
            return Err(StoreError::TransactionOpen {
                chain: self.shared.id.clone(),
                open: open.clone(),
            });
        }
        state.closed = true;
        debug!(chain = %self.shared.id, "closed transaction chain");
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failed.is_some()
    }
}

impl std::fmt::Debug for StoreTransactionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransactionChain")
            .field("id", &self.shared.id)
            .finish()
    }
}
