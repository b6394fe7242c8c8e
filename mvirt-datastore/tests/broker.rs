//! Integration tests for the data broker and its commit pipeline.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use mvirt_datastore::{
    CommitStep, DataBroker, DataTreeCandidate, DataTreeCommitCohort, DatastoreConfig,
    LogicalDatastoreType, ModificationType, Node, NoopCommitStep, Path, StoreError,
    ValidationContext,
};

const CONFIG: LogicalDatastoreType = LogicalDatastoreType::Configuration;
const OPER: LogicalDatastoreType = LogicalDatastoreType::Operational;

fn broker() -> DataBroker {
    init_tracing();
    DataBroker::in_memory(DatastoreConfig::default()).unwrap()
}

/// Phase counters shared between a test and its cohort.
#[derive(Default)]
struct CohortStats {
    votes: AtomicUsize,
    pre_commits: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
}

/// Cohort that records its phases and optionally vetoes.
struct RecordingCohort {
    veto: bool,
    stats: Arc<CohortStats>,
}

impl RecordingCohort {
    fn new(veto: bool) -> (Self, Arc<CohortStats>) {
        let stats = Arc::new(CohortStats::default());
        (
            Self {
                veto,
                stats: stats.clone(),
            },
            stats,
        )
    }
}

struct CountingStep(Arc<CohortStats>);

#[async_trait]
impl CommitStep for CountingStep {
    async fn pre_commit(&self) -> mvirt_datastore::Result<()> {
        self.0.pre_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> mvirt_datastore::Result<()> {
        self.0.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) -> mvirt_datastore::Result<()> {
        self.0.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DataTreeCommitCohort for RecordingCohort {
    async fn can_commit(
        &self,
        _tx_id: &str,
        candidates: &[DataTreeCandidate],
        _context: &dyn ValidationContext,
    ) -> mvirt_datastore::Result<Box<dyn CommitStep>> {
        self.stats.votes.fetch_add(1, Ordering::SeqCst);
        assert!(!candidates.is_empty());
        if self.veto {
            return Err(StoreError::DataValidationFailed {
                path: candidates[0].root_path().clone(),
                reason: "vetoed by test cohort".to_string(),
            });
        }
        Ok(Box::new(CountingStep(self.stats.clone())))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_submit_then_read() {
    let broker = broker();
    let mut tx = broker.new_write_only_transaction();
    assert!(tx.id().starts_with("DOM-"));
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    let info = tx.submit().await.unwrap();

    assert_eq!(info.versions.get(&CONFIG), Some(&1));
    assert!(!info.versions.contains_key(&OPER));

    let rtx = broker.new_read_only_transaction();
    assert_eq!(
        rtx.read(CONFIG, &test_path()).await.unwrap(),
        Some(test_container())
    );
    assert!(!rtx.exists(OPER, &test_path()).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_spans_both_stores() {
    let broker = broker();
    let mut tx = broker.new_read_write_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.write(OPER, &test_path(), test_with_entries(&[1])).unwrap();
    assert!(tx.exists(OPER, &outer_entry_path(1)).await.unwrap());

    let info = tx.submit().await.unwrap();
    assert_eq!(info.versions.len(), 2);

    let rtx = broker.new_read_only_transaction();
    assert!(rtx.exists(CONFIG, &test_path()).await.unwrap());
    assert!(rtx.exists(OPER, &outer_entry_path(1)).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_external_veto_aborts_every_store() {
    let broker = broker();
    let (cohort, stats) = RecordingCohort::new(true);
    let _registration = broker
        .register_commit_cohort(CONFIG, &test_path(), cohort)
        .unwrap();

    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.write(OPER, &test_path(), test_container()).unwrap();
    let err = tx.submit().await.unwrap_err();

    assert!(matches!(err, StoreError::DataValidationFailed { .. }));
    assert_eq!(stats.votes.load(Ordering::SeqCst), 1);

    let rtx = broker.new_read_only_transaction();
    assert!(!rtx.exists(CONFIG, &test_path()).await.unwrap());
    assert!(!rtx.exists(OPER, &test_path()).await.unwrap());
    assert_eq!(broker.store(CONFIG).unwrap().version(), 0);
    assert_eq!(broker.store(OPER).unwrap().version(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cohort_runs_all_phases_for_touched_path() {
    let broker = broker();
    let (cohort, stats) = RecordingCohort::new(false);
    let _registration = broker
        .register_commit_cohort(CONFIG, &outer_entry_wildcard(), cohort)
        .unwrap();

    // Does not touch the registered path.
    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.submit().await.unwrap();
    assert_eq!(stats.votes.load(Ordering::SeqCst), 0);

    let mut tx = broker.new_write_only_transaction();
    tx.merge(CONFIG, &outer_list_path(), outer_list(&[1, 2])).unwrap();
    tx.submit().await.unwrap();

    assert_eq!(stats.votes.load(Ordering::SeqCst), 1);
    assert_eq!(stats.pre_commits.load(Ordering::SeqCst), 1);
    assert_eq!(stats.commits.load(Ordering::SeqCst), 1);
    assert_eq!(stats.aborts.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_cohort_registration_is_not_consulted() {
    let broker = broker();
    let (cohort, stats) = RecordingCohort::new(true);
    let registration = broker
        .register_commit_cohort(CONFIG, &Path::root(), cohort)
        .unwrap();
    registration.close();

    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.submit().await.unwrap();
    assert_eq!(stats.votes.load(Ordering::SeqCst), 0);
}

struct NoopCohort;

#[async_trait]
impl DataTreeCommitCohort for NoopCohort {
    async fn can_commit(
        &self,
        _tx_id: &str,
        candidates: &[DataTreeCandidate],
        _context: &dyn ValidationContext,
    ) -> mvirt_datastore::Result<Box<dyn CommitStep>> {
        assert_eq!(candidates[0].root_node().modification_type(), ModificationType::Delete);
        Ok(Box::new(NoopCommitStep))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cohort_sees_restricted_candidate() {
    let broker = broker();
    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.submit().await.unwrap();

    let _registration = broker
        .register_commit_cohort(CONFIG, &test_path(), NoopCohort)
        .unwrap();
    let mut tx = broker.new_write_only_transaction();
    tx.delete(CONFIG, &test_path()).unwrap();
    tx.submit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conflicting_submits() {
    let broker = broker();
    let mut first = broker.new_write_only_transaction();
    let mut second = broker.new_write_only_transaction();
    first.write(CONFIG, &test_path(), test_container()).unwrap();
    second
        .write(CONFIG, &test_path(), test_with_entries(&[1]))
        .unwrap();

    let first = first.submit();
    let second = second.submit();
    first.await.unwrap();
    let err = second.await.unwrap_err();
    assert!(err.is_optimistic_conflict(), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_transaction_commits() {
    let broker = broker();
    let tx = broker.new_write_only_transaction();
    let info = tx.submit().await.unwrap();
    assert!(info.versions.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_transaction_rejects_writes() {
    let broker = broker();
    let mut tx = broker.new_read_write_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    assert!(tx.cancel());
    assert!(!tx.cancel());

    let err = tx.write(OPER, &test_path(), test_container()).unwrap_err();
    assert!(matches!(err, StoreError::TransactionClosed(_)));
    let err = tx.submit().await.unwrap_err();
    assert!(matches!(err, StoreError::TransactionClosed(_)));
    assert_eq!(broker.store(CONFIG).unwrap().version(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_wait_outside_pipeline() {
    let broker = broker();
    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    let handle = tx.submit();

    let info = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.versions.get(&CONFIG), Some(&1));
}

/// Cohort that waits on a nested commit from inside the pipeline.
struct ReentrantCohort {
    broker: DataBroker,
    observed: Arc<parking_lot::Mutex<Option<StoreError>>>,
}

#[async_trait]
impl DataTreeCommitCohort for ReentrantCohort {
    async fn can_commit(
        &self,
        _tx_id: &str,
        _candidates: &[DataTreeCandidate],
        _context: &dyn ValidationContext,
    ) -> mvirt_datastore::Result<Box<dyn CommitStep>> {
        let mut nested = self.broker.new_write_only_transaction();
        nested.write(OPER, &test_path(), test_container())?;
        let handle = nested.submit();
        *self.observed.lock() = handle.wait().err();
        Ok(Box::new(NoopCommitStep))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_inside_pipeline_fails_fast() {
    let broker = broker();
    let observed = Arc::new(parking_lot::Mutex::new(None));
    let _registration = broker
        .register_commit_cohort(
            CONFIG,
            &test_path(),
            ReentrantCohort {
                broker: broker.clone(),
                observed: observed.clone(),
            },
        )
        .unwrap();

    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.submit().await.unwrap();

    let err = observed.lock().clone().expect("nested wait should fail");
    assert!(matches!(err, StoreError::WouldDeadlock(_)));
    assert!(err.is_invariant_violation());
}

/// Cohort that parks the pipeline in canCommit until released.
struct Blocking {
    entered: Arc<tokio::sync::Notify>,
    gate: Arc<tokio::sync::Semaphore>,
}

#[async_trait]
impl DataTreeCommitCohort for Blocking {
    async fn can_commit(
        &self,
        _tx_id: &str,
        _candidates: &[DataTreeCandidate],
        _context: &dyn ValidationContext,
    ) -> mvirt_datastore::Result<Box<dyn CommitStep>> {
        self.entered.notify_one();
        let _permit = self.gate.acquire().await;
        Ok(Box::new(NoopCommitStep))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_queue_full() {
    init_tracing();
    let config = DatastoreConfig {
        max_commit_queue_size: 1,
        ..Default::default()
    };
    let broker = DataBroker::in_memory(config).unwrap();
    let entered = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let _registration = broker
        .register_commit_cohort(
            CONFIG,
            &Path::root(),
            Blocking {
                entered: entered.clone(),
                gate: gate.clone(),
            },
        )
        .unwrap();

    let submit = |name: &str| {
        let mut tx = broker.new_write_only_transaction();
        tx.write(CONFIG, &Path::from_names([name]), Node::container(name).build())
            .unwrap();
        tx.submit()
    };

    let first = submit("a");
    entered.notified().await;
    let second = submit("b");
    let third = submit("c");

    let err = third.await.unwrap_err();
    assert!(matches!(err, StoreError::CommitQueueFull(_)));

    gate.add_permits(10);
    first.await.unwrap();
    second.await.unwrap();

    let rtx = broker.new_read_only_transaction();
    assert!(!rtx.exists(CONFIG, &Path::from_names(["c"])).await.unwrap());
}

/// Cohort that accepts every vote and then fails in commit.
struct FailingCommit;

struct FailingStep;

#[async_trait]
impl CommitStep for FailingStep {
    async fn commit(&self) -> mvirt_datastore::Result<()> {
        Err(StoreError::IllegalState("cohort commit failed".to_string()))
    }
}

#[async_trait]
impl DataTreeCommitCohort for FailingCommit {
    async fn can_commit(
        &self,
        _tx_id: &str,
        _candidates: &[DataTreeCandidate],
        _context: &dyn ValidationContext,
    ) -> mvirt_datastore::Result<Box<dyn CommitStep>> {
        Ok(Box::new(FailingStep))
    }
}

#[derive(Clone, Default)]
struct FailedChains(Arc<parking_lot::Mutex<Vec<String>>>);

impl mvirt_datastore::TransactionChainListener for FailedChains {
    fn on_transaction_chain_failed(&self, _chain: &str, tx_id: &str, _cause: &StoreError) {
        self.0.lock().push(tx_id.to_string());
    }

    fn on_transaction_chain_successful(&self, _chain: &str) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_failure_after_pre_commit_is_not_rolled_back() {
    let broker = broker();
    let _registration = broker
        .register_commit_cohort(CONFIG, &test_path(), FailingCommit)
        .unwrap();

    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.write(OPER, &test_path(), test_container()).unwrap();
    let tx_id = tx.id().to_string();
    let err = tx.submit().await.unwrap_err();

    match &err {
        StoreError::PartialCommit { tx, cause } => {
            assert_eq!(tx, &tx_id);
            assert!(cause.contains("cohort commit failed"), "unexpected cause: {cause}");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The stores committed before the cohort failed and stay committed.
    let rtx = broker.new_read_only_transaction();
    assert!(rtx.exists(CONFIG, &test_path()).await.unwrap());
    assert!(rtx.exists(OPER, &test_path()).await.unwrap());
    assert_eq!(broker.store(CONFIG).unwrap().version(), 1);
    assert_eq!(broker.store(OPER).unwrap().version(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_failure_after_pre_commit_fails_chain() {
    let broker = broker();
    let _registration = broker
        .register_commit_cohort(CONFIG, &test_path(), FailingCommit)
        .unwrap();
    let listener = FailedChains::default();
    let chain = broker.create_transaction_chain(listener.clone());

    let mut tx = chain.new_write_only_transaction().unwrap();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    let tx_id = tx.id().to_string();
    let err = tx.submit().await.unwrap_err();
    assert!(matches!(err, StoreError::PartialCommit { .. }));

    assert!(chain.is_failed());
    assert_eq!(*listener.0.lock(), vec![tx_id]);
    assert!(matches!(
        chain.new_write_only_transaction().unwrap_err(),
        StoreError::ChainFailed { .. }
    ));

    let rtx = broker.new_read_only_transaction();
    assert!(rtx.exists(CONFIG, &test_path()).await.unwrap());
}
