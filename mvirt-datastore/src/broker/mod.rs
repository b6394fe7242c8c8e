//! Data broker.
//!
//! The broker fronts the logical data stores. Its transactions span stores,
//! and every submitted transaction is committed through one serialized
//! three-phase commit pipeline together with the external commit cohorts
//! registered for the paths it touches.

mod chain;
mod cohort;
mod pipeline;
mod transaction;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::info;

use crate::config::DatastoreConfig;
use crate::error::{Result, StoreError};
use crate::notify::{
    DataChangeListener, DataChangeScope, DataTreeChangeListener, ListenerRegistration,
};
use crate::store::{InMemoryDataStore, LogicalDatastoreType};
use crate::tree::Path;

pub use chain::{TransactionChain, TransactionChainListener};
pub use cohort::{CommitCohortRegistration, CommitStep, DataTreeCommitCohort, NoopCommitStep};
pub use pipeline::CommitHandle;
pub use transaction::{ReadTransaction, ReadWriteTransaction, WriteTransaction};

use cohort::CohortRegistry;
use pipeline::CommitPipeline;

/// Outcome of a committed broker transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub tx_id: String,
    /// New version of every store the transaction wrote to.
    pub versions: BTreeMap<LogicalDatastoreType, u64>,
    pub committed_at: DateTime<Utc>,
}

pub(crate) struct BrokerInner {
    stores: BTreeMap<LogicalDatastoreType, InMemoryDataStore>,
    pipeline: CommitPipeline,
    cohorts: Arc<CohortRegistry>,
    tx_counter: AtomicU64,
    chain_counter: AtomicU64,
}

impl BrokerInner {
    pub(crate) fn store(&self, store: LogicalDatastoreType) -> Result<&InMemoryDataStore> {
        self.stores
            .get(&store)
            .ok_or_else(|| StoreError::IllegalArgument(format!("no {store} data store")))
    }

    pub(crate) fn store_types(&self) -> impl Iterator<Item = LogicalDatastoreType> + '_ {
        self.stores.keys().copied()
    }

    pub(crate) fn next_tx_id(&self) -> String {
        format!("DOM-{}", self.tx_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn next_chain_id(&self) -> String {
        format!("DOM-CHAIN-{}", self.chain_counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Builder for [`DataBroker`].
#[derive(Default)]
pub struct DataBrokerBuilder {
    stores: Vec<InMemoryDataStore>,
    config: DatastoreConfig,
    handle: Option<Handle>,
}

impl DataBrokerBuilder {
    /// Add a store. At most one store per logical type.
    pub fn store(mut self, store: InMemoryDataStore) -> Self {
        self.stores.push(store);
        self
    }

    pub fn config(mut self, config: DatastoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime for the commit pipeline. Defaults to the current runtime.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<DataBroker> {
        self.config.validate()?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| StoreError::NoRuntime(e.to_string()))?,
        };

        let mut stores = BTreeMap::new();
        for store in self.stores {
            let store_type = store.datastore_type();
            if stores.insert(store_type, store).is_some() {
                return Err(StoreError::IllegalArgument(format!(
                    "duplicate {store_type} data store"
                )));
            }
        }

        let pipeline = CommitPipeline::start(&handle, self.config.max_commit_queue_size);
        info!(
            stores = stores.len(),
            queue = self.config.max_commit_queue_size,
            "created data broker"
        );
        Ok(DataBroker {
            inner: Arc::new(BrokerInner {
                stores,
                pipeline,
                cohorts: Arc::new(CohortRegistry::default()),
                tx_counter: AtomicU64::new(0),
                chain_counter: AtomicU64::new(0),
            }),
        })
    }
}

/// Transactional front end over the logical data stores.
#[derive(Clone)]
pub struct DataBroker {
    inner: Arc<BrokerInner>,
}

impl DataBroker {
    pub fn builder() -> DataBrokerBuilder {
        DataBrokerBuilder::default()
    }

    /// Broker over fresh configuration and operational stores on the current runtime.
    pub fn in_memory(config: DatastoreConfig) -> Result<Self> {
        let mut builder = Self::builder().config(config.clone());
        for store_type in [
            LogicalDatastoreType::Configuration,
            LogicalDatastoreType::Operational,
        ] {
            builder = builder.store(
                InMemoryDataStore::builder(store_type)
                    .config(config.clone())
                    .build()?,
            );
        }
        builder.build()
    }

    pub fn store(&self, store: LogicalDatastoreType) -> Option<&InMemoryDataStore> {
        self.inner.stores.get(&store)
    }

    pub fn new_read_only_transaction(&self) -> ReadTransaction {
        let subtxs = self
            .inner
            .stores
            .iter()
            .map(|(store_type, store)| (*store_type, store.new_read_only_transaction()))
            .collect();
        ReadTransaction::new(self.inner.next_tx_id(), subtxs)
    }

    pub fn new_write_only_transaction(&self) -> WriteTransaction {
        WriteTransaction::new(self.inner.next_tx_id(), self.inner.clone(), None)
    }

    pub fn new_read_write_transaction(&self) -> ReadWriteTransaction {
        ReadWriteTransaction::new(self.inner.next_tx_id(), self.inner.clone(), None)
    }

    pub fn create_transaction_chain(
        &self,
        listener: impl TransactionChainListener,
    ) -> TransactionChain {
        TransactionChain::new(
            self.inner.next_chain_id(),
            self.inner.clone(),
            Arc::new(listener),
        )
    }

    /// Register a cohort taking part in commits that touch `path` in `store`.
    pub fn register_commit_cohort(
        &self,
        store: LogicalDatastoreType,
        path: &Path,
        cohort: impl DataTreeCommitCohort,
    ) -> Result<CommitCohortRegistration> {
        let path = self.inner.store(store)?.snapshot().normalize_path(path)?;
        Ok(self
            .inner
            .cohorts
            .register(store, path, Arc::new(cohort)))
    }

    pub fn register_change_listener(
        &self,
        store: LogicalDatastoreType,
        path: &Path,
        listener: impl DataChangeListener,
        scope: DataChangeScope,
    ) -> Result<ListenerRegistration> {
        self.inner
            .store(store)?
            .register_change_listener(path, listener, scope)
    }

    pub fn register_tree_change_listener(
        &self,
        store: LogicalDatastoreType,
        path: &Path,
        listener: impl DataTreeChangeListener,
    ) -> Result<ListenerRegistration> {
        self.inner
            .store(store)?
            .register_tree_change_listener(path, listener)
    }
}

impl std::fmt::Debug for DataBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBroker")
            .field("stores", &self.inner.stores.keys().collect::<Vec<_>>())
            .field("cohorts", &self.inner.cohorts.len())
            .finish()
    }
}
