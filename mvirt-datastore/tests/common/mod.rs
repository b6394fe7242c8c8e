//! Test helpers for mvirt-datastore integration tests.

#![allow(dead_code)]

use std::time::Duration;

use mvirt_datastore::{Node, Path, PathArgument};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// How long a test waits for a notification before failing.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a fmt subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_path() -> Path {
    Path::from_names(["test"])
}

pub fn outer_list_path() -> Path {
    Path::from_names(["test", "outer-list"])
}

pub fn outer_entry_path(id: i64) -> Path {
    outer_list_path().child(PathArgument::entry("outer-list", [("id", id)]))
}

/// `/test/outer-list/*`
pub fn outer_entry_wildcard() -> Path {
    Path::builder()
        .node("test")
        .node("outer-list")
        .wildcard("outer-list")
        .build()
}

pub fn test_container() -> Node {
    Node::container("test").build()
}

pub fn outer_entry(id: i64) -> Node {
    Node::map_entry("outer-list", "id", id)
}

pub fn outer_list(ids: &[i64]) -> Node {
    Node::list("outer-list")
        .with_children(ids.iter().map(|id| outer_entry(*id)))
        .build()
}

/// `/test` holding an outer list with the given entries.
pub fn test_with_entries(ids: &[i64]) -> Node {
    Node::container("test").with_child(outer_list(ids)).build()
}

/// Receive the next notification or fail after [`EVENT_TIMEOUT`].
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("listener channel closed")
}

/// Assert that nothing is delivered within a short grace period.
pub async fn assert_quiet<T>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(received.is_err(), "unexpected notification");
}
