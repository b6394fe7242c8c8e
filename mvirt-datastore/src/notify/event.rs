//! Scope-qualified change events.

use std::collections::{BTreeMap, BTreeSet};

use crate::tree::{DataTreeCandidateNode, ModificationType, Node, Path};

/// How far below the registered path changes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataChangeScope {
    /// Only the registered node itself being created, replaced or removed.
    Base,
    /// The node and its direct children.
    One,
    /// The node and everything below it.
    Subtree,
}

impl DataChangeScope {
    fn max_depth(self) -> Option<usize> {
        match self {
            DataChangeScope::Base => Some(0),
            DataChangeScope::One => Some(1),
            DataChangeScope::Subtree => None,
        }
    }
}

/// Changes seen by a data change listener for one commit (or several, when coalesced).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChangeEvent {
    created: BTreeMap<Path, Node>,
    updated: BTreeMap<Path, Node>,
    removed: BTreeSet<Path>,
    original: BTreeMap<Path, Node>,
    original_subtree: Option<Node>,
    updated_subtree: Option<Node>,
}

impl DataChangeEvent {
    /// Build the event for a registration at `path` from the candidate node at that path.
    pub(crate) fn from_candidate(
        path: &Path,
        node: &DataTreeCandidateNode,
        scope: DataChangeScope,
    ) -> Option<Self> {
        let mut event = Self::default();
        if !event.collect(path, node, 0, scope.max_depth()) {
            return None;
        }
        event.original_subtree = node.data_before().cloned();
        event.updated_subtree = node.data_after().cloned();
        Some(event)
    }

    fn collect(
        &mut self,
        path: &Path,
        node: &DataTreeCandidateNode,
        depth: usize,
        max_depth: Option<usize>,
    ) -> bool {
        let descend = max_depth.map_or(true, |max| depth < max);
        let mut recorded = false;

        match node.modification_type() {
            ModificationType::Unmodified => return false,
            ModificationType::Write => {
                match (node.data_before(), node.data_after()) {
                    (Some(before), Some(after)) => {
                        self.original.insert(path.clone(), before.clone());
                        self.updated.insert(path.clone(), after.clone());
                    }
                    (None, Some(after)) => {
                        self.created.insert(path.clone(), after.clone());
                    }
                    _ => {}
                }
                recorded = true;
            }
            ModificationType::Delete => {
                if let Some(before) = node.data_before() {
                    self.original.insert(path.clone(), before.clone());
                }
                self.removed.insert(path.clone());
                recorded = true;
            }
            ModificationType::SubtreeModified => {}
        }

        let mut below = false;
        if descend {
            for child in node.children() {
                let child_path = path.child(child.identifier().clone());
                below |= self.collect(&child_path, &child, depth + 1, max_depth);
            }
        }

        if node.modification_type() == ModificationType::SubtreeModified && below {
            if let (Some(before), Some(after)) = (node.data_before(), node.data_after()) {
                self.original.insert(path.clone(), before.clone());
                self.updated.insert(path.clone(), after.clone());
            }
            recorded = true;
        }
        recorded
    }

    /// Nodes created, keyed by path.
    pub fn created_data(&self) -> &BTreeMap<Path, Node> {
        &self.created
    }

    /// Nodes that existed before and were changed, keyed by path, with their new data.
    pub fn updated_data(&self) -> &BTreeMap<Path, Node> {
        &self.updated
    }

    /// Paths of removed nodes.
    pub fn removed_paths(&self) -> &BTreeSet<Path> {
        &self.removed
    }

    /// Previous data of updated and removed nodes.
    pub fn original_data(&self) -> &BTreeMap<Path, Node> {
        &self.original
    }

    /// Registered node before the change.
    pub fn original_subtree(&self) -> Option<&Node> {
        self.original_subtree.as_ref()
    }

    /// Registered node after the change.
    pub fn updated_subtree(&self) -> Option<&Node> {
        self.updated_subtree.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Fold a later event into this one.
    ///
    /// The result describes the net change across both, except that a path
    /// created and then removed is still reported as removed.
    pub fn merge(&mut self, later: DataChangeEvent) {
        for (path, node) in later.created {
            if self.removed.remove(&path) {
                self.updated.insert(path, node);
            } else {
                self.created.insert(path, node);
            }
        }
        for (path, node) in later.updated {
            if let Some(existing) = self.created.get_mut(&path) {
                *existing = node;
            } else {
                self.updated.insert(path, node);
            }
        }
        for path in later.removed {
            self.created.remove(&path);
            self.updated.remove(&path);
            self.removed.insert(path);
        }
        for (path, node) in later.original {
            self.original.entry(path).or_insert(node);
        }
        self.updated_subtree = later.updated_subtree;
    }
}
