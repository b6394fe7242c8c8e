//! Immutable point-in-time views of a data tree.

use std::sync::Arc;

use crate::error::Result;

use super::data_tree::TreeShared;
use super::modification::DataTreeModification;
use super::node::Node;
use super::path::Path;

/// Immutable view of a data tree at one version.
#[derive(Clone)]
pub struct DataTreeSnapshot {
    root: Node,
    version: u64,
    shared: Arc<TreeShared>,
}

impl DataTreeSnapshot {
    pub(crate) fn new(root: Node, version: u64, shared: Arc<TreeShared>) -> Self {
        Self {
            root,
            version,
            shared,
        }
    }

    /// Snapshot over a different root, based on the same version.
    pub(crate) fn derive(&self, root: Node) -> Self {
        Self::new(root, self.version, self.shared.clone())
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Version of the tree this snapshot is based on.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Node at `path`, if present.
    pub fn read(&self, path: &Path) -> Option<Node> {
        self.root.find(path.args()).cloned()
    }

    /// Normalize a caller-supplied path with the tree's validation context.
    pub fn normalize_path(&self, path: &Path) -> Result<Path> {
        self.shared.normalize_path(path)
    }

    /// Open a modification against this snapshot.
    pub fn new_modification(&self) -> DataTreeModification {
        DataTreeModification::new(self.clone())
    }

    pub(crate) fn shared(&self) -> &Arc<TreeShared> {
        &self.shared
    }
}

impl std::fmt::Debug for DataTreeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTreeSnapshot")
            .field("version", &self.version)
            .finish()
    }
}
