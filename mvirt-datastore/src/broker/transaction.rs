//! Broker transactions spanning the logical data stores.
//!
//! A write transaction enlists one store transaction per store it touches,
//! lazily on first access. Submitting readies all of them and queues the
//! resulting cohorts, plus any external cohorts whose paths were touched, to
//! the commit pipeline as one unit.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::store::{self, LogicalDatastoreType};
use crate::tree::{Node, Path};

use super::chain::ChainCore;
use super::pipeline::CommitHandle;
use super::BrokerInner;

/// Read-only transaction over a snapshot of every store.
pub struct ReadTransaction {
    id: String,
    subtxs: BTreeMap<LogicalDatastoreType, store::ReadOnlyTransaction>,
}

impl ReadTransaction {
    pub(crate) fn new(
        id: String,
        subtxs: BTreeMap<LogicalDatastoreType, store::ReadOnlyTransaction>,
    ) -> Self {
        trace!(tx = %id, stores = subtxs.len(), "allocated read transaction");
        Self { id, subtxs }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn subtx(&self, store: LogicalDatastoreType) -> Result<&store::ReadOnlyTransaction> {
        self.subtxs
            .get(&store)
            .ok_or_else(|| StoreError::IllegalArgument(format!("no {store} data store")))
    }

    pub async fn read(&self, store: LogicalDatastoreType, path: &Path) -> Result<Option<Node>> {
        self.subtx(store)?.read(path).await
    }

    pub async fn exists(&self, store: LogicalDatastoreType, path: &Path) -> Result<bool> {
        self.subtx(store)?.exists(path).await
    }

    pub fn close(&mut self) {
        for tx in self.subtxs.values_mut() {
            tx.close();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Submitted,
    Cancelled,
}

/// State shared by write and read-write broker transactions.
struct WriteCore {
    id: String,
    broker: Arc<BrokerInner>,
    chain: Option<Arc<ChainCore>>,
    subtxs: BTreeMap<LogicalDatastoreType, store::ReadWriteTransaction>,
    state: State,
}

impl WriteCore {
    fn new(id: String, broker: Arc<BrokerInner>, chain: Option<Arc<ChainCore>>) -> Self {
        trace!(tx = %id, chained = chain.is_some(), "allocated write transaction");
        Self {
            id,
            broker,
            chain,
            subtxs: BTreeMap::new(),
            state: State::Open,
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Submitted => Err(StoreError::TransactionSealed(self.id.clone())),
            State::Cancelled => Err(StoreError::TransactionClosed(self.id.clone())),
        }
    }

    fn subtx(&mut self, store: LogicalDatastoreType) -> Result<&mut store::ReadWriteTransaction> {
        self.check_open()?;
        match self.subtxs.entry(store) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let tx = match &self.chain {
                    Some(chain) => chain.store_transaction(store)?,
                    None => self.broker.store(store)?.new_read_write_transaction(),
                };
                trace!(tx = %self.id, subtx = tx.id(), %store, "enlisted store transaction");
                Ok(entry.insert(tx))
            }
        }
    }

    fn submit(&mut self) -> CommitHandle {
        let pipeline = &self.broker.pipeline;
        if let Err(e) = self.check_open() {
            return pipeline.reject(self.id.clone(), &[], None, e);
        }
        self.state = State::Submitted;
        let on_complete = self
            .chain
            .as_ref()
            .map(|chain| chain.transaction_submitted(&self.id));

        let mut stores = Vec::with_capacity(self.subtxs.len());
        let mut external = Vec::new();
        for (store, tx) in self.subtxs.iter_mut() {
            match tx.ready() {
                Ok(cohort) => {
                    external.extend(self.broker.cohorts.cohorts_for(
                        &self.id,
                        *store,
                        cohort.candidate(),
                        cohort.validation_context(),
                    ));
                    stores.push(cohort);
                }
                Err(e) => return pipeline.reject(self.id.clone(), &stores, on_complete, e),
            }
        }

        debug!(
            tx = %self.id,
            stores = stores.len(),
            cohorts = external.len(),
            "submitting transaction"
        );
        pipeline.submit(self.id.clone(), stores, external, on_complete)
    }

    fn cancel(&mut self) -> bool {
        if self.state != State::Open {
            return false;
        }
        self.state = State::Cancelled;
        for tx in self.subtxs.values_mut() {
            tx.cancel();
        }
        if let Some(chain) = &self.chain {
            chain.transaction_cancelled(&self.id);
        }
        debug!(tx = %self.id, "transaction cancelled");
        true
    }
}

impl Drop for WriteCore {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Write-only transaction spanning the logical stores.
pub struct WriteTransaction {
    core: WriteCore,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("id", &self.core.id)
            .finish()
    }
}

impl WriteTransaction {
    pub(crate) fn new(id: String, broker: Arc<BrokerInner>, chain: Option<Arc<ChainCore>>) -> Self {
        Self {
            core: WriteCore::new(id, broker, chain),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn write(&mut self, store: LogicalDatastoreType, path: &Path, node: Node) -> Result<()> {
        self.core.subtx(store)?.write(path, node)
    }

    pub fn merge(&mut self, store: LogicalDatastoreType, path: &Path, node: Node) -> Result<()> {
        self.core.subtx(store)?.merge(path, node)
    }

    pub fn delete(&mut self, store: LogicalDatastoreType, path: &Path) -> Result<()> {
        self.core.subtx(store)?.delete(path)
    }

    /// Queue the transaction for commit.
    pub fn submit(mut self) -> CommitHandle {
        self.core.submit()
    }

    /// Discard the transaction. Returns false if it was already cancelled.
    pub fn cancel(&mut self) -> bool {
        self.core.cancel()
    }
}

/// Read-write transaction spanning the logical stores.
///
/// Reads of a store observe this transaction's own writes to it.
pub struct ReadWriteTransaction {
    core: WriteCore,
}

impl std::fmt::Debug for ReadWriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteTransaction")
            .field("id", &self.core.id)
            .finish()
    }
}

impl ReadWriteTransaction {
    pub(crate) fn new(id: String, broker: Arc<BrokerInner>, chain: Option<Arc<ChainCore>>) -> Self {
        Self {
            core: WriteCore::new(id, broker, chain),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub async fn read(&mut self, store: LogicalDatastoreType, path: &Path) -> Result<Option<Node>> {
        self.core.subtx(store)?.read(path).await
    }

    pub async fn exists(&mut self, store: LogicalDatastoreType, path: &Path) -> Result<bool> {
        self.core.subtx(store)?.exists(path).await
    }

    pub fn write(&mut self, store: LogicalDatastoreType, path: &Path, node: Node) -> Result<()> {
        self.core.subtx(store)?.write(path, node)
    }

    pub fn merge(&mut self, store: LogicalDatastoreType, path: &Path, node: Node) -> Result<()> {
        self.core.subtx(store)?.merge(path, node)
    }

    pub fn delete(&mut self, store: LogicalDatastoreType, path: &Path) -> Result<()> {
        self.core.subtx(store)?.delete(path)
    }

    pub fn submit(mut self) -> CommitHandle {
        self.core.submit()
    }

    pub fn cancel(&mut self) -> bool {
        self.core.cancel()
    }
}
