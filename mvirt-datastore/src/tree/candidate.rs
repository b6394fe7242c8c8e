//! Candidates: the diff between a base tree and a sealed modification.
//!
//! A candidate node records how one node changed and carries its data before
//! and after. Nodes that carry an operation of their own have their children
//! listed explicitly; below that the children are derived on demand by
//! comparing before and after.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::modification::{OpKind, OpNode, SealedModification};
use super::node::Node;
use super::path::{Path, PathArgument};

/// How a candidate node changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationType {
    /// Nothing changed at or below this node.
    Unmodified,
    /// The node was created or replaced.
    Write,
    /// The node was removed.
    Delete,
    /// The node itself survives, some of its descendants changed.
    SubtreeModified,
}

type ExplicitChildren = Arc<BTreeMap<PathArgument, DataTreeCandidateNode>>;

/// One node of a candidate tree.
#[derive(Clone)]
pub struct DataTreeCandidateNode {
    identifier: PathArgument,
    modification_type: ModificationType,
    data_before: Option<Node>,
    data_after: Option<Node>,
    children: Option<ExplicitChildren>,
}

impl DataTreeCandidateNode {
    /// Derive the change of one node from its data before and after.
    pub fn from_data(identifier: PathArgument, before: Option<Node>, after: Option<Node>) -> Self {
        let modification_type = match (&before, &after) {
            (None, None) => ModificationType::Unmodified,
            (None, Some(_)) => ModificationType::Write,
            (Some(_), None) => ModificationType::Delete,
            (Some(b), Some(a)) if b == a => ModificationType::Unmodified,
            (Some(b), Some(a)) if !b.is_leaf() && b.kind() == a.kind() => {
                ModificationType::SubtreeModified
            }
            _ => ModificationType::Write,
        };
        Self {
            identifier,
            modification_type,
            data_before: before,
            data_after: after,
            children: None,
        }
    }

    /// A node whose data did not change.
    pub fn unmodified(identifier: PathArgument, data: Option<Node>) -> Self {
        Self {
            identifier,
            modification_type: ModificationType::Unmodified,
            data_before: data.clone(),
            data_after: data,
            children: None,
        }
    }

    /// Build the candidate node for `op` with the given before and after data.
    pub(crate) fn from_op(
        identifier: PathArgument,
        op: &OpNode,
        before: Option<&Node>,
        after: Option<&Node>,
    ) -> Self {
        match op.kind {
            OpKind::Touch if before.is_some() && after.is_some() => {
                let mut children = BTreeMap::new();
                for (id, child_op) in &op.children {
                    let child = Self::from_op(
                        id.clone(),
                        child_op,
                        before.and_then(|n| n.child(id)),
                        after.and_then(|n| n.child(id)),
                    );
                    if child.modification_type != ModificationType::Unmodified {
                        children.insert(id.clone(), child);
                    }
                }
                let modification_type = if children.is_empty() {
                    ModificationType::Unmodified
                } else {
                    ModificationType::SubtreeModified
                };
                Self {
                    identifier,
                    modification_type,
                    data_before: before.cloned(),
                    data_after: after.cloned(),
                    children: Some(Arc::new(children)),
                }
            }
            OpKind::Write => match (before, after) {
                (Some(b), Some(a)) if b == a => Self::unmodified(identifier, Some(a.clone())),
                (_, Some(_)) => Self {
                    identifier,
                    modification_type: ModificationType::Write,
                    data_before: before.cloned(),
                    data_after: after.cloned(),
                    children: None,
                },
                _ => Self::from_data(identifier, before.cloned(), after.cloned()),
            },
            OpKind::Delete if before.is_none() => Self::unmodified(identifier, None),
            _ => Self::from_data(identifier, before.cloned(), after.cloned()),
        }
    }

    pub fn identifier(&self) -> &PathArgument {
        &self.identifier
    }

    pub fn modification_type(&self) -> ModificationType {
        self.modification_type
    }

    pub fn data_before(&self) -> Option<&Node> {
        self.data_before.as_ref()
    }

    pub fn data_after(&self) -> Option<&Node> {
        self.data_after.as_ref()
    }

    pub fn is_modified(&self) -> bool {
        self.modification_type != ModificationType::Unmodified
    }

    /// Modified direct children.
    pub fn children(&self) -> Vec<DataTreeCandidateNode> {
        if let Some(explicit) = &self.children {
            return explicit.values().cloned().collect();
        }
        if self.modification_type == ModificationType::Unmodified {
            return Vec::new();
        }

        let empty = BTreeMap::new();
        let before = self
            .data_before
            .as_ref()
            .and_then(Node::children)
            .unwrap_or(&empty);
        let after = self
            .data_after
            .as_ref()
            .and_then(Node::children)
            .unwrap_or(&empty);

        let mut changed = Vec::new();
        for (id, b) in before {
            let a = after.get(id);
            if a != Some(b) {
                changed.push(Self::from_data(id.clone(), Some(b.clone()), a.cloned()));
            }
        }
        for (id, a) in after {
            if !before.contains_key(id) {
                changed.push(Self::from_data(id.clone(), None, Some(a.clone())));
            }
        }
        changed
    }

    /// Candidate node for the direct child `id`, modified or not. `None` if the
    /// child exists neither before nor after.
    pub fn child(&self, id: &PathArgument) -> Option<DataTreeCandidateNode> {
        if let Some(explicit) = &self.children {
            if let Some(node) = explicit.get(id) {
                return Some(node.clone());
            }
        }
        let before = self.data_before.as_ref().and_then(|n| n.child(id)).cloned();
        let after = self.data_after.as_ref().and_then(|n| n.child(id)).cloned();
        if before.is_none() && after.is_none() {
            return None;
        }
        if self.children.is_some() {
            // Children with an operation are listed explicitly, anything else is untouched.
            return Some(Self::unmodified(id.clone(), after));
        }
        Some(Self::from_data(id.clone(), before, after))
    }

    /// Candidate node at a relative path below this one.
    pub fn descendant(&self, relative: &[PathArgument]) -> Option<DataTreeCandidateNode> {
        let mut current = self.clone();
        for arg in relative {
            current = current.child(arg)?;
        }
        Some(current)
    }
}

impl fmt::Debug for DataTreeCandidateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTreeCandidateNode")
            .field("identifier", &self.identifier)
            .field("modification_type", &self.modification_type)
            .field("data_before", &self.data_before)
            .field("data_after", &self.data_after)
            .finish()
    }
}

/// A rooted candidate tree.
#[derive(Clone)]
pub struct DataTreeCandidate {
    root_path: Path,
    root: DataTreeCandidateNode,
    sealed: Option<Arc<SealedModification>>,
}

impl DataTreeCandidate {
    pub fn new(root_path: Path, root: DataTreeCandidateNode) -> Self {
        Self {
            root_path,
            root,
            sealed: None,
        }
    }

    pub(crate) fn from_sealed(sealed: Arc<SealedModification>) -> Self {
        let root = DataTreeCandidateNode::from_op(
            sealed.base_root.identifier().clone(),
            &sealed.terminals,
            Some(&sealed.base_root),
            Some(&sealed.after_root),
        );
        Self {
            root_path: Path::root(),
            root,
            sealed: Some(sealed),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn root_node(&self) -> &DataTreeCandidateNode {
        &self.root
    }

    /// True if nothing at or below the root changed.
    pub fn is_empty(&self) -> bool {
        !self.root.is_modified()
    }

    /// Candidate rooted at `path`, if `path` lies at or below the root path.
    pub fn restrict(&self, path: &Path) -> Option<DataTreeCandidate> {
        let relative = path.relative_to(&self.root_path)?;
        let node = self.root.descendant(relative)?;
        Some(DataTreeCandidate::new(path.clone(), node))
    }

    /// Modified candidate subtrees whose path matches `pattern`, which may contain wildcards.
    pub fn matching(&self, pattern: &Path) -> Vec<DataTreeCandidate> {
        let mut out = Vec::new();
        if pattern.len() < self.root_path.len()
            || !Path::from_iter(pattern.args()[..self.root_path.len()].iter().cloned())
                .matches(&self.root_path)
        {
            return out;
        }
        collect_matches(
            &self.root,
            &self.root_path,
            &pattern.args()[self.root_path.len()..],
            &mut out,
        );
        out
    }

    pub(crate) fn sealed(&self) -> Option<&Arc<SealedModification>> {
        self.sealed.as_ref()
    }
}

fn collect_matches(
    node: &DataTreeCandidateNode,
    path: &Path,
    pattern: &[PathArgument],
    out: &mut Vec<DataTreeCandidate>,
) {
    if !node.is_modified() {
        return;
    }
    let Some((first, rest)) = pattern.split_first() else {
        out.push(DataTreeCandidate::new(path.clone(), node.clone()));
        return;
    };
    if first.is_wildcard() {
        for child in node.children() {
            if first.matches(child.identifier()) {
                let child_path = path.child(child.identifier().clone());
                collect_matches(&child, &child_path, rest, out);
            }
        }
    } else if let Some(child) = node.child(first) {
        collect_matches(&child, &path.child(first.clone()), rest, out);
    }
}

impl fmt::Debug for DataTreeCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTreeCandidate")
            .field("root_path", &self.root_path)
            .field("root", &self.root)
            .finish()
    }
}
