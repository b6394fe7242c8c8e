//! Listener registration and commit publication for one store.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::Result;
use crate::tree::{CommitResult, DataTreeCandidate, DataTreeCandidateNode, Node, Path};

use super::listener_tree::{Interest, ListenerTree, Registered};
use super::queue::{self, DeliveryState, ListenerKind};
use super::ListenerOptions;

/// Registrations of one store.
///
/// The same lock guards registration and commit publication, so a new
/// registration's initial event is always queued before the events of later
/// commits and never duplicates data already in it.
pub(crate) struct NotificationManager {
    store: String,
    tree: Arc<Mutex<ListenerTree>>,
    handle: Handle,
    max_batch: usize,
}

impl NotificationManager {
    pub(crate) fn new(store: impl Into<String>, handle: Handle, max_batch: usize) -> Self {
        Self {
            store: store.into(),
            tree: Arc::new(Mutex::new(ListenerTree::default())),
            handle,
            max_batch,
        }
    }

    /// Register a listener. `current_root` is read under the registration lock.
    pub(crate) fn register(
        &self,
        path: Path,
        interest: Interest,
        listener: ListenerKind,
        options: ListenerOptions,
        current_root: impl FnOnce() -> Node,
    ) -> ListenerRegistration {
        let mut tree = self.tree.lock();
        let id = tree.next_id();
        let state = Arc::new(DeliveryState::new(path.clone()));
        let queue = queue::spawn(
            &self.handle,
            listener,
            state.clone(),
            options,
            self.max_batch,
        );

        let root = current_root();
        let has_data = root.children().is_some_and(|c| !c.is_empty());
        if has_data {
            let initial = DataTreeCandidate::new(
                Path::root(),
                DataTreeCandidateNode::from_data(root.identifier().clone(), None, Some(root)),
            );
            if let Some(notification) = interest.notification(initial.matching(&path)) {
                // A closed receiver means the runtime is shutting down.
                let _ = queue.send(notification);
            }
        }

        tree.insert(
            &path,
            Registered {
                id,
                interest,
                queue,
            },
        );
        debug!(store = %self.store, path = %path, registration = id, "registered listener");

        ListenerRegistration {
            id,
            path,
            state,
            tree: Arc::downgrade(&self.tree),
        }
    }

    /// Run `commit` and publish its candidate while holding the registration lock.
    pub(crate) fn commit_and_publish(
        &self,
        commit: impl FnOnce() -> Result<CommitResult>,
    ) -> Result<CommitResult> {
        let tree = self.tree.lock();
        let result = commit()?;
        tree.publish(&result.candidate);
        Ok(result)
    }

    pub(crate) fn registration_count(&self) -> usize {
        self.tree.lock().len()
    }
}

/// Handle of a listener registration. Dropping it closes the registration.
pub struct ListenerRegistration {
    id: u64,
    path: Path,
    state: Arc<DeliveryState>,
    tree: Weak<Mutex<ListenerTree>>,
}

impl ListenerRegistration {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        !self.state.is_open()
    }

    /// Stop delivery. No callback starts after this returns; a callback
    /// running on another thread is waited for.
    pub fn close(&self) {
        if !self.state.close() {
            return;
        }
        if let Some(tree) = self.tree.upgrade() {
            tree.lock().remove(&self.path, self.id);
        }
        debug!(path = %self.path, registration = self.id, "closed listener registration");
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
