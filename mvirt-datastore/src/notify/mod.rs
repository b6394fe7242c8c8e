//! Change notification.
//!
//! Listeners register against a path (which may contain wildcard list
//! entries) and receive either scope-qualified [`DataChangeEvent`]s or the
//! matching [`DataTreeCandidate`]s of each commit. Delivery is per
//! registration, serialized and in commit order.

mod event;
mod listener_tree;
mod manager;
mod queue;

pub use event::{DataChangeEvent, DataChangeScope};
pub use manager::ListenerRegistration;

pub(crate) use listener_tree::Interest;
pub(crate) use manager::NotificationManager;
pub(crate) use queue::ListenerKind;

use crate::tree::DataTreeCandidate;

/// Listener for scope-qualified change events.
pub trait DataChangeListener: Send + Sync + 'static {
    fn on_data_changed(&self, event: DataChangeEvent);
}

/// Listener for candidate subtrees.
pub trait DataTreeChangeListener: Send + Sync + 'static {
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>);
}

impl<F> DataChangeListener for F
where
    F: Fn(DataChangeEvent) + Send + Sync + 'static,
{
    fn on_data_changed(&self, event: DataChangeEvent) {
        self(event)
    }
}

impl<F> DataTreeChangeListener for F
where
    F: Fn(Vec<DataTreeCandidate>) + Send + Sync + 'static,
{
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>) {
        self(changes)
    }
}

/// Per-registration delivery options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Allow several queued notifications to be merged into one callback.
    pub coalesce: bool,
}

impl ListenerOptions {
    pub fn coalescing() -> Self {
        Self { coalesce: true }
    }
}
