//! Integration tests for change listeners.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use mvirt_datastore::{
    DataBroker, DataChangeEvent, DataChangeScope, DataTreeCandidate, DatastoreConfig,
    InMemoryDataStore, ListenerOptions, LogicalDatastoreType, ModificationType, Path,
};
use tokio::sync::mpsc;

const CONFIG: LogicalDatastoreType = LogicalDatastoreType::Configuration;

fn broker() -> DataBroker {
    init_tracing();
    DataBroker::in_memory(DatastoreConfig::default()).unwrap()
}

fn tree_channel() -> (
    impl Fn(Vec<DataTreeCandidate>) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Vec<DataTreeCandidate>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |changes| {
            let _ = tx.send(changes);
        },
        rx,
    )
}

fn event_channel() -> (
    impl Fn(DataChangeEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<DataChangeEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |event| {
            let _ = tx.send(event);
        },
        rx,
    )
}

async fn write_test(broker: &DataBroker) {
    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_container()).unwrap();
    tx.submit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_notifies_listener() {
    let broker = broker();
    write_test(&broker).await;

    let (listener, mut rx) = tree_channel();
    let _registration = broker
        .register_tree_change_listener(CONFIG, &test_path(), listener)
        .unwrap();

    // Initial event for the data already present.
    let initial = next(&mut rx).await;
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].root_node().modification_type(), ModificationType::Write);

    let mut tx = broker.new_write_only_transaction();
    tx.delete(CONFIG, &test_path()).unwrap();
    tx.submit().await.unwrap();

    let rtx = broker.new_read_only_transaction();
    assert!(!rtx.exists(CONFIG, &test_path()).await.unwrap());

    let changes = next(&mut rx).await;
    assert_eq!(changes.len(), 1);
    let node = changes[0].root_node();
    assert_eq!(changes[0].root_path(), &test_path());
    assert_eq!(node.modification_type(), ModificationType::Delete);
    assert_eq!(node.data_before(), Some(&test_container()));
    assert_eq!(node.data_after(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_initial_event_on_empty_store() {
    let broker = broker();
    let (listener, mut rx) = tree_channel();
    let _registration = broker
        .register_tree_change_listener(CONFIG, &test_path(), listener)
        .unwrap();
    assert_quiet(&mut rx).await;

    write_test(&broker).await;
    let changes = next(&mut rx).await;
    assert_eq!(changes[0].root_node().modification_type(), ModificationType::Write);
    assert_eq!(changes[0].root_node().data_before(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_arrive_in_commit_order() {
    let broker = broker();
    write_test(&broker).await;
    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &outer_list_path(), outer_list(&[])).unwrap();
    tx.submit().await.unwrap();

    let (listener, mut rx) = event_channel();
    let _registration = broker
        .register_change_listener(CONFIG, &outer_list_path(), listener, DataChangeScope::One)
        .unwrap();
    let initial = next(&mut rx).await;
    assert!(initial.created_data().contains_key(&outer_list_path()));

    let mut handles = Vec::new();
    for id in 0..20 {
        let mut tx = broker.new_write_only_transaction();
        tx.write(CONFIG, &outer_entry_path(id), outer_entry(id)).unwrap();
        handles.push(tx.submit());
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for id in 0..20 {
        let event = next(&mut rx).await;
        assert!(
            event.created_data().contains_key(&outer_entry_path(id)),
            "event {id} out of order: {event:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scope_limits_events() {
    let broker = broker();
    write_test(&broker).await;

    let (base, mut base_rx) = event_channel();
    let (subtree, mut subtree_rx) = event_channel();
    let _base = broker
        .register_change_listener(CONFIG, &test_path(), base, DataChangeScope::Base)
        .unwrap();
    let _subtree = broker
        .register_change_listener(CONFIG, &test_path(), subtree, DataChangeScope::Subtree)
        .unwrap();
    next(&mut base_rx).await;
    next(&mut subtree_rx).await;

    let mut tx = broker.new_write_only_transaction();
    tx.merge(CONFIG, &outer_list_path(), outer_list(&[1])).unwrap();
    tx.submit().await.unwrap();

    let event = next(&mut subtree_rx).await;
    assert!(event.created_data().contains_key(&outer_list_path()));
    assert!(event.created_data().contains_key(&outer_entry_path(1)));
    assert_eq!(event.original_subtree(), Some(&test_container()));
    assert_eq!(event.updated_subtree(), Some(&test_with_entries(&[1])));

    // Nothing happened to /test itself.
    assert_quiet(&mut base_rx).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wildcard_registration_merges_matches() {
    let broker = broker();
    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &test_path(), test_with_entries(&[])).unwrap();
    tx.submit().await.unwrap();

    let (listener, mut rx) = tree_channel();
    let _registration = broker
        .register_tree_change_listener(CONFIG, &outer_entry_wildcard(), listener)
        .unwrap();

    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &outer_entry_path(1), outer_entry(1)).unwrap();
    tx.write(CONFIG, &outer_entry_path(2), outer_entry(2)).unwrap();
    tx.submit().await.unwrap();

    let changes = next(&mut rx).await;
    let paths: Vec<Path> = changes.iter().map(|c| c.root_path().clone()).collect();
    assert_eq!(paths, vec![outer_entry_path(1), outer_entry_path(2)]);

    let mut tx = broker.new_write_only_transaction();
    tx.write(CONFIG, &Path::from_names(["other"]), mvirt_datastore::Node::container("other").build())
        .unwrap();
    tx.submit().await.unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_registration_receives_nothing() {
    let broker = broker();
    let (listener, mut rx) = tree_channel();
    let registration = broker
        .register_tree_change_listener(CONFIG, &test_path(), listener)
        .unwrap();
    assert_eq!(broker.store(CONFIG).unwrap().listener_count(), 1);

    registration.close();
    assert!(registration.is_closed());
    assert_eq!(broker.store(CONFIG).unwrap().listener_count(), 0);

    write_test(&broker).await;
    let received = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
    // The queue task ends once the registration is closed.
    assert!(matches!(received, Err(_) | Ok(None)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_listener_does_not_stop_delivery() {
    let broker = broker();
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx_events, mut rx) = mpsc::unbounded_channel();
    let counter = calls.clone();
    let _registration = broker
        .register_tree_change_listener(CONFIG, &test_path(), move |changes: Vec<DataTreeCandidate>| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("listener failure");
            }
            let _ = tx_events.send(changes);
        })
        .unwrap();

    write_test(&broker).await;
    let mut tx = broker.new_write_only_transaction();
    tx.delete(CONFIG, &test_path()).unwrap();
    tx.submit().await.unwrap();

    let changes = next(&mut rx).await;
    assert_eq!(changes[0].root_node().modification_type(), ModificationType::Delete);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_coalescing_listener_sees_net_change() {
    init_tracing();
    let store = InMemoryDataStore::new(CONFIG).unwrap();

    let (listener, mut rx) = event_channel();
    let gate = Arc::new(std::sync::Barrier::new(2));
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let first_call = Arc::new(AtomicUsize::new(0));
    let listener = {
        let gate = gate.clone();
        let first_call = first_call.clone();
        move |event: DataChangeEvent| {
            // Hold the first delivery so later commits queue up behind it.
            if first_call.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = entered_tx.send(());
                gate.wait();
            }
            listener(event);
        }
    };
    let _registration = store
        .register_change_listener_with_options(
            &test_path(),
            listener,
            DataChangeScope::Subtree,
            ListenerOptions::coalescing(),
        )
        .unwrap();

    let commit = |f: &dyn Fn(&mut mvirt_datastore::store::WriteTransaction)| {
        let mut tx = store.new_write_only_transaction();
        f(&mut tx);
        tx.ready().unwrap()
    };
    use mvirt_datastore::store::ThreePhaseCommitCohort;
    async fn run(cohort: mvirt_datastore::store::StoreCommitCohort) {
        assert!(cohort.can_commit().await.unwrap());
        cohort.pre_commit().await.unwrap();
        cohort.commit().await.unwrap();
    }

    run(commit(&|tx| tx.write(&test_path(), test_container()).unwrap())).await;
    next(&mut entered_rx).await;
    run(commit(&|tx| tx.merge(&outer_list_path(), outer_list(&[1])).unwrap())).await;
    run(commit(&|tx| tx.merge(&outer_list_path(), outer_list(&[2])).unwrap())).await;
    tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();

    let first = next(&mut rx).await;
    assert!(first.created_data().contains_key(&test_path()));

    let merged = next(&mut rx).await;
    assert!(merged.created_data().contains_key(&outer_entry_path(1)));
    assert!(merged.created_data().contains_key(&outer_entry_path(2)));
    assert_quiet(&mut rx).await;
}
