//! In-memory data store.
//!
//! One store is one independently versioned data tree plus its listener
//! registrations. Transactions allocated from the store are committed through
//! their [`StoreCommitCohort`]; the broker drives several stores' cohorts as
//! one transaction.

mod chain;
mod cohort;
mod transaction;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::info;

use crate::config::DatastoreConfig;
use crate::error::{Result, StoreError};
use crate::notify::{
    DataChangeListener, DataChangeScope, DataTreeChangeListener, Interest, ListenerKind,
    ListenerOptions, ListenerRegistration, NotificationManager,
};
use crate::tree::{AcceptAll, DataTree, DataTreeSnapshot, Path, ValidationContext};

pub use chain::StoreTransactionChain;
pub use cohort::{StoreCommitCohort, ThreePhaseCommitCohort};
pub use transaction::{ReadOnlyTransaction, ReadWriteTransaction, WriteTransaction};

/// The logical data stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalDatastoreType {
    /// Intended configuration.
    Configuration,
    /// Observed operational state.
    Operational,
}

impl LogicalDatastoreType {
    /// Prefix of transaction ids allocated by a store of this type.
    pub fn prefix(&self) -> &'static str {
        match self {
            LogicalDatastoreType::Configuration => "CFG",
            LogicalDatastoreType::Operational => "OPER",
        }
    }
}

impl fmt::Display for LogicalDatastoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalDatastoreType::Configuration => f.write_str("configuration"),
            LogicalDatastoreType::Operational => f.write_str("operational"),
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) name: String,
    pub(crate) datastore_type: LogicalDatastoreType,
    pub(crate) tree: DataTree,
    pub(crate) notifications: NotificationManager,
    tx_counter: AtomicU64,
    chain_counter: AtomicU64,
}

impl StoreInner {
    pub(crate) fn next_tx_id(&self) -> String {
        let n = self.tx_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.datastore_type.prefix(), n)
    }

    fn next_chain_id(&self) -> String {
        let n = self.chain_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-CHAIN-{}", self.datastore_type.prefix(), n)
    }
}

/// Builder for [`InMemoryDataStore`].
pub struct InMemoryDataStoreBuilder {
    datastore_type: LogicalDatastoreType,
    name: Option<String>,
    config: DatastoreConfig,
    validation: Box<dyn ValidationContext>,
    handle: Option<Handle>,
}

impl InMemoryDataStoreBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: DatastoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validation(mut self, validation: Box<dyn ValidationContext>) -> Self {
        self.validation = validation;
        self
    }

    /// Runtime for listener delivery tasks. Defaults to the current runtime.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<InMemoryDataStore> {
        self.config.validate()?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| StoreError::NoRuntime(e.to_string()))?,
        };
        let name = self
            .name
            .unwrap_or_else(|| self.datastore_type.to_string());
        let tree = DataTree::with_validation(name.clone(), self.validation, &self.config);
        let notifications =
            NotificationManager::new(name.clone(), handle, self.config.max_listener_batch);

        info!(store = %name, "created in-memory data store");
        Ok(InMemoryDataStore {
            inner: Arc::new(StoreInner {
                name,
                datastore_type: self.datastore_type,
                tree,
                notifications,
                tx_counter: AtomicU64::new(0),
                chain_counter: AtomicU64::new(0),
            }),
        })
    }
}

/// An in-memory, versioned data store.
#[derive(Clone)]
pub struct InMemoryDataStore {
    inner: Arc<StoreInner>,
}

impl InMemoryDataStore {
    pub fn builder(datastore_type: LogicalDatastoreType) -> InMemoryDataStoreBuilder {
        InMemoryDataStoreBuilder {
            datastore_type,
            name: None,
            config: DatastoreConfig::default(),
            validation: Box::new(AcceptAll),
            handle: None,
        }
    }

    /// Store with default configuration on the current runtime.
    pub fn new(datastore_type: LogicalDatastoreType) -> Result<Self> {
        Self::builder(datastore_type).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn datastore_type(&self) -> LogicalDatastoreType {
        self.inner.datastore_type
    }

    /// Version of the last committed tree.
    pub fn version(&self) -> u64 {
        self.inner.tree.version()
    }

    pub fn snapshot(&self) -> DataTreeSnapshot {
        self.inner.tree.snapshot()
    }

    pub fn new_read_only_transaction(&self) -> ReadOnlyTransaction {
        ReadOnlyTransaction::new(self.inner.next_tx_id(), self.inner.tree.snapshot())
    }

    pub fn new_write_only_transaction(&self) -> WriteTransaction {
        WriteTransaction::new(
            self.inner.next_tx_id(),
            self.inner.clone(),
            self.inner.tree.snapshot(),
            None,
        )
    }

    pub fn new_read_write_transaction(&self) -> ReadWriteTransaction {
        ReadWriteTransaction::new(
            self.inner.next_tx_id(),
            self.inner.clone(),
            self.inner.tree.snapshot(),
            None,
        )
    }

    pub fn create_transaction_chain(&self) -> StoreTransactionChain {
        StoreTransactionChain::new(self.inner.next_chain_id(), self.inner.clone())
    }

    /// Swap the validation context used for subsequent writes and commits.
    pub fn on_global_context_updated(&self, validation: Box<dyn ValidationContext>) {
        self.inner.tree.set_validation_context(validation);
    }

    pub fn validation_context(&self) -> Arc<Box<dyn ValidationContext>> {
        self.inner.tree.validation_context()
    }

    /// Register a scope-qualified change listener.
    pub fn register_change_listener(
        &self,
        path: &Path,
        listener: impl DataChangeListener,
        scope: DataChangeScope,
    ) -> Result<ListenerRegistration> {
        self.register_change_listener_with_options(
            path,
            listener,
            scope,
            ListenerOptions::default(),
        )
    }

    pub fn register_change_listener_with_options(
        &self,
        path: &Path,
        listener: impl DataChangeListener,
        scope: DataChangeScope,
        options: ListenerOptions,
    ) -> Result<ListenerRegistration> {
        let path = self.inner.tree.snapshot().normalize_path(path)?;
        Ok(self.inner.notifications.register(
            path,
            Interest::DataChange(scope),
            ListenerKind::DataChange(Arc::new(listener)),
            options,
            || self.inner.tree.snapshot().root().clone(),
        ))
    }

    /// Register a listener receiving the candidate subtrees at `path`.
    pub fn register_tree_change_listener(
        &self,
        path: &Path,
        listener: impl DataTreeChangeListener,
    ) -> Result<ListenerRegistration> {
        self.register_tree_change_listener_with_options(path, listener, ListenerOptions::default())
    }

    pub fn register_tree_change_listener_with_options(
        &self,
        path: &Path,
        listener: impl DataTreeChangeListener,
        options: ListenerOptions,
    ) -> Result<ListenerRegistration> {
        let path = self.inner.tree.snapshot().normalize_path(path)?;
        Ok(self.inner.notifications.register(
            path,
            Interest::DataTree,
            ListenerKind::DataTree(Arc::new(listener)),
            options,
            || self.inner.tree.snapshot().root().clone(),
        ))
    }

    /// Number of live listener registrations.
    pub fn listener_count(&self) -> usize {
        self.inner.notifications.registration_count()
    }
}

impl fmt::Debug for InMemoryDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDataStore")
            .field("name", &self.inner.name)
            .field("version", &self.inner.tree.version())
            .finish()
    }
}
