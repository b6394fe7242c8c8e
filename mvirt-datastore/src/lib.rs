//! mvirt transactional data tree
//!
//! Versioned in-memory stores of hierarchical data with snapshot isolation,
//! optimistic concurrency, transaction chains, a three-phase commit broker
//! spanning the configuration and operational stores, and change
//! notification.
//!
//! # Example
//! ```ignore
//! use mvirt_datastore::{DataBroker, DatastoreConfig, LogicalDatastoreType, Node, Path};
//!
//! let broker = DataBroker::in_memory(DatastoreConfig::default())?;
//! let mut tx = broker.new_write_only_transaction();
//! tx.write(
//!     LogicalDatastoreType::Configuration,
//!     &Path::from_names(["vms"]),
//!     Node::container("vms").build(),
//! )?;
//! let info = tx.submit().await?;
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod notify;
pub mod store;
pub mod tree;

pub use broker::{
    CommitCohortRegistration, CommitHandle, CommitInfo, CommitStep, DataBroker,
    DataBrokerBuilder, DataTreeCommitCohort, NoopCommitStep, ReadTransaction,
    ReadWriteTransaction, TransactionChain, TransactionChainListener, WriteTransaction,
};
pub use config::DatastoreConfig;
pub use error::{Result, StoreError};
pub use notify::{
    DataChangeEvent, DataChangeListener, DataChangeScope, DataTreeChangeListener,
    ListenerOptions, ListenerRegistration,
};
pub use store::{InMemoryDataStore, InMemoryDataStoreBuilder, LogicalDatastoreType};
pub use tree::{
    DataTree, DataTreeCandidate, DataTreeCandidateNode, DataTreeModification, DataTreeSnapshot,
    ModificationType, Node, NodeKind, Path, PathArgument, Value, ValidationContext,
};
