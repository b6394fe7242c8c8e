//! Per-registration delivery.
//!
//! Every registration owns one unbounded queue drained by one task, so a
//! listener sees notifications one at a time and in commit order. Closing a
//! registration flips its open flag under the same lock the delivery task
//! holds while calling the listener, so no callback starts after `close`
//! returns.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::tree::{DataTreeCandidate, Path};

use super::event::DataChangeEvent;
use super::{DataChangeListener, DataTreeChangeListener, ListenerOptions};

/// One queued notification.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    DataChanged(DataChangeEvent),
    TreeChanged(Vec<DataTreeCandidate>),
}

impl Notification {
    /// Fold `next` into `self`. Returns `next` back if the two cannot be combined.
    fn absorb(&mut self, next: Notification) -> Option<Notification> {
        match (self, next) {
            (Notification::DataChanged(event), Notification::DataChanged(later)) => {
                event.merge(later);
                None
            }
            (Notification::TreeChanged(changes), Notification::TreeChanged(later)) => {
                changes.extend(later);
                None
            }
            (_, next) => Some(next),
        }
    }
}

/// The listener a queue delivers to.
pub(crate) enum ListenerKind {
    DataChange(Arc<dyn DataChangeListener>),
    DataTree(Arc<dyn DataTreeChangeListener>),
}

/// Open flag shared by a registration handle and its delivery task.
pub(crate) struct DeliveryState {
    path: Path,
    open: ReentrantMutex<Cell<bool>>,
}

impl DeliveryState {
    pub(crate) fn new(path: Path) -> Self {
        Self {
            path,
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    /// Mark closed. Waits for an in-flight callback on another thread to finish.
    /// Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let open = self.open.lock();
        open.replace(false)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.lock().get()
    }
}

/// Start the delivery task for one registration.
pub(crate) fn spawn(
    handle: &Handle,
    listener: ListenerKind,
    state: Arc<DeliveryState>,
    options: ListenerOptions,
    max_batch: usize,
) -> mpsc::UnboundedSender<Notification> {
    let (tx, rx) = mpsc::unbounded_channel();
    let batch = if options.coalesce { max_batch.max(1) } else { 1 };
    handle.spawn(run(rx, listener, state, batch));
    tx
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    listener: ListenerKind,
    state: Arc<DeliveryState>,
    max_batch: usize,
) {
    'outer: while let Some(mut pending) = rx.recv().await {
        let mut taken = 1;
        while taken < max_batch {
            let Ok(next) = rx.try_recv() else { break };
            taken += 1;
            if let Some(next) = pending.absorb(next) {
                if !deliver(&listener, &state, pending) {
                    break 'outer;
                }
                pending = next;
            }
        }
        if !deliver(&listener, &state, pending) {
            break;
        }
    }
    debug!(path = %state.path, "listener delivery stopped");
}

fn deliver(listener: &ListenerKind, state: &DeliveryState, notification: Notification) -> bool {
    let open = state.open.lock();
    if !open.get() {
        return false;
    }
    let outcome = catch_unwind(AssertUnwindSafe(|| match (listener, notification) {
        (ListenerKind::DataChange(l), Notification::DataChanged(event)) => l.on_data_changed(event),
        (ListenerKind::DataTree(l), Notification::TreeChanged(changes)) => {
            l.on_data_tree_changed(changes)
        }
        _ => warn!(path = %state.path, "notification does not match listener kind"),
    }));
    if outcome.is_err() {
        warn!(path = %state.path, "listener panicked while handling a notification");
    }
    true
}
