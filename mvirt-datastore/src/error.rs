//! Store error types.

use thiserror::Error;

use crate::tree::Path;

/// Errors that can occur during data store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A read could not be served.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The transaction was closed or cancelled.
    #[error("transaction {0} is closed")]
    TransactionClosed(String),

    /// The transaction was already readied; no further modifications are allowed.
    #[error("transaction {0} is already sealed")]
    TransactionSealed(String),

    /// A chain already has an outstanding open transaction.
    #[error("transaction chain {chain}: previous transaction {open} is not ready")]
    TransactionOpen { chain: String, open: String },

    /// A transaction in the chain failed, the chain is unusable.
    #[error("transaction chain {chain} failed: {cause}")]
    ChainFailed { chain: String, cause: String },

    /// The chain was closed by its owner.
    #[error("transaction chain {0} is closed")]
    ChainClosed(String),

    /// Operation invoked out of protocol order.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invalid path or node supplied by the caller.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The parent of the target path does not exist.
    #[error("parent of {0} does not exist")]
    MissingParent(Path),

    /// Optimistic concurrency control detected an intervening commit.
    #[error("optimistic lock failed at {path}: {reason}")]
    OptimisticLockFailed { path: Path, reason: String },

    /// Structural validation or a commit cohort vetoed the data.
    #[error("data validation failed at {path}: {reason}")]
    DataValidationFailed { path: Path, reason: String },

    /// A cohort answered `false` to canCommit.
    #[error("commit of {0} was rejected")]
    CommitRejected(String),

    /// A failure after preCommit; some stores may have applied their changes.
    #[error("transaction {tx} partially committed: {cause}")]
    PartialCommit { tx: String, cause: String },

    /// Blocking on the commit pipeline from inside the same pipeline.
    #[error("transaction {0} would deadlock the commit pipeline")]
    WouldDeadlock(String),

    /// The commit pipeline queue is full.
    #[error("commit queue full, rejected {0}")]
    CommitQueueFull(String),

    /// The commit pipeline has shut down.
    #[error("commit pipeline is closed")]
    PipelineClosed,

    /// No tokio runtime is available to run background tasks.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),
}

impl StoreError {
    /// Programmer errors: not retryable and not recoverable by the engine.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StoreError::TransactionSealed(_)
                | StoreError::TransactionOpen { .. }
                | StoreError::ChainClosed(_)
                | StoreError::IllegalState(_)
                | StoreError::WouldDeadlock(_)
        )
    }

    /// Conflicts caused by a concurrent commit. The caller may retry with a fresh transaction.
    pub fn is_optimistic_conflict(&self) -> bool {
        matches!(self, StoreError::OptimisticLockFailed { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
