//! Broker transaction chains.
//!
//! A chain hands out one open transaction at a time across all stores. Each
//! store is backed by its own store chain, created on first use, so a new
//! transaction sees its predecessor's writes even before they committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::{self, LogicalDatastoreType, StoreTransactionChain};

use super::pipeline::CompletionHook;
use super::transaction::{ReadTransaction, ReadWriteTransaction, WriteTransaction};
use super::{BrokerInner, CommitInfo};

/// Receives the final outcome of a [`TransactionChain`].
///
/// Exactly one of the two callbacks fires, at most once. They run on the
/// commit pipeline task; waiting on a commit handle from inside them fails
/// with `WouldDeadlock`.
pub trait TransactionChainListener: Send + Sync + 'static {
    /// A chained transaction failed. The chain accepts no further transactions.
    fn on_transaction_chain_failed(&self, chain: &str, tx_id: &str, cause: &StoreError);

    /// The chain was closed and every submitted transaction committed.
    fn on_transaction_chain_successful(&self, chain: &str);
}

#[derive(Default)]
struct ChainState {
    open: Option<String>,
    store_chains: BTreeMap<LogicalDatastoreType, StoreTransactionChain>,
    pending: usize,
    failed: Option<String>,
    closed: bool,
    notified: bool,
}

impl ChainState {
    fn success_due(&mut self) -> bool {
        if self.closed && self.pending == 0 && self.failed.is_none() && !self.notified {
            self.notified = true;
            return true;
        }
        false
    }
}

enum Outcome {
    Failed(String, StoreError),
    Successful,
}

pub(crate) struct ChainCore {
    id: String,
    broker: Arc<BrokerInner>,
    listener: Arc<dyn TransactionChainListener>,
    state: Mutex<ChainState>,
}

impl ChainCore {
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

    fn store_chain<'a>(
        &self,
        state: &'a mut ChainState,
        store: LogicalDatastoreType,
    ) -> Result<&'a StoreTransactionChain> {
        if !state.store_chains.contains_key(&store) {
            let chain = self.broker.store(store)?.create_transaction_chain();
            debug!(chain = %self.id, store_chain = chain.id(), %store, "created store chain");
            state.store_chains.insert(store, chain);
        }
        state
            .store_chains
            .get(&store)
            .ok_or_else(|| StoreError::IllegalArgument(format!("no {store} data store")))
    }

    fn allocate(&self) -> Result<String> {
        let mut state = self.state.lock();
        self.check_allocation(&state)?;
        let id = self.broker.next_tx_id();
        state.open = Some(id.clone());
        Ok(id)
    }

    /// Store transaction for the currently open broker transaction.
    pub(crate) fn store_transaction(
        &self,
        store: LogicalDatastoreType,
    ) -> Result<store::ReadWriteTransaction> {
        let mut state = self.state.lock();
        self.store_chain(&mut state, store)?
            .new_read_write_transaction()
    }

    fn read_transaction(&self) -> Result<ReadTransaction> {
        let mut state = self.state.lock();
        self.check_allocation(&state)?;
        let mut subtxs = BTreeMap::new();
        for store in self.broker.store_types() {
            let tx = self.store_chain(&mut state, store)?.new_read_only_transaction()?;
            subtxs.insert(store, tx);
        }
        Ok(ReadTransaction::new(self.broker.next_tx_id(), subtxs))
    }

    pub(crate) fn transaction_submitted(self: &Arc<Self>, tx_id: &str) -> CompletionHook {
        {
            let mut state = self.state.lock();
            if state.open.as_deref() == Some(tx_id) {
                state.open = None;
            }
            state.pending += 1;
        }
        let core = self.clone();
        let tx_id = tx_id.to_string();
        Box::new(move |result| core.transaction_completed(&tx_id, result))
    }

    pub(crate) fn transaction_cancelled(&self, tx_id: &str) {
        let mut state = self.state.lock();
        if state.open.as_deref() == Some(tx_id) {
            state.open = None;
        }
    }

    fn transaction_completed(&self, tx_id: &str, result: &Result<CommitInfo>) {
        let outcome = {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            match result {
                Err(cause) if state.failed.is_none() => {
                    state.failed = Some(cause.to_string());
                    state.notified = true;
                    Some(Outcome::Failed(tx_id.to_string(), cause.clone()))
                }
                Err(_) => None,
                Ok(_) => state.success_due().then_some(Outcome::Successful),
            }
        };
        self.notify(outcome);
    }

    fn notify(&self, outcome: Option<Outcome>) {
        match outcome {
            Some(Outcome::Failed(tx_id, cause)) => {
                warn!(chain = %self.id, tx = %tx_id, error = %cause, "transaction chain failed");
                self.listener
                    .on_transaction_chain_failed(&self.id, &tx_id, &cause);
            }
            Some(Outcome::Successful) => {
                debug!(chain = %self.id, "transaction chain completed");
                self.listener.on_transaction_chain_successful(&self.id);
            }
            None => {}
        }
    }
}

/// A chain of causally ordered broker transactions.
pub struct TransactionChain {
    core: Arc<ChainCore>,
}

impl TransactionChain {
    pub(crate) fn new(
        id: String,
        broker: Arc<BrokerInner>,
        listener: Arc<dyn TransactionChainListener>,
    ) -> Self {
        debug!(chain = %id, "created transaction chain");
        Self {
            core: Arc::new(ChainCore {
                id,
                broker,
                listener,
                state: Mutex::new(ChainState::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Read-only transaction seeing the writes of previously submitted chain transactions.
    pub fn new_read_only_transaction(&self) -> Result<ReadTransaction> {
        self.core.read_transaction()
    }

    pub fn new_write_only_transaction(&self) -> Result<WriteTransaction> {
        let id = self.core.allocate()?;
        Ok(WriteTransaction::new(
            id,
            self.core.broker.clone(),
            Some(self.core.clone()),
        ))
    }

    pub fn new_read_write_transaction(&self) -> Result<ReadWriteTransaction> {
        let id = self.core.allocate()?;
        Ok(ReadWriteTransaction::new(
            id,
            self.core.broker.clone(),
            Some(self.core.clone()),
        ))
    }

    /// Close the chain. Fails if a transaction is still open.
    ///
    /// The success callback fires once every submitted transaction committed.
    pub fn close(&self) -> Result<()> {
        let outcome = {
            let mut state = self.core.state.lock();
            if state.closed {
                return Ok(());
            }
            if let Some(open) = &state.open {
                return Err(StoreError::TransactionOpen {
                    chain: self.core.id.clone(),
                    open: open.clone(),
                });
            }
            state.closed = true;
            for chain in state.store_chains.values() {
                if let Err(e) = chain.close() {
                    warn!(chain = %self.core.id, store_chain = chain.id(), error = %e, "failed to close store chain");
                }
            }
            state.success_due().then_some(Outcome::Successful)
        };
        debug!(chain = %self.core.id, "closed transaction chain");
        self.core.notify(outcome);
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.core.state.lock().failed.is_some()
    }
}

impl std::fmt::Debug for TransactionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionChain")
            .field("id", &self.core.id)
            .finish()
    }
}
