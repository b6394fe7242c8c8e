//! Copy-on-write modifications.
//!
//! A modification is opened against a snapshot. Operations are applied
//! eagerly to a private root so reads through the modification see them, and
//! are also recorded twice: as an ordered log used to replay the modification
//! on top of a newer tree, and as a tree of terminal operations used for
//! conflict detection and candidate construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Result, StoreError};

use super::candidate::DataTreeCandidate;
use super::data_tree::TreeShared;
use super::node::Node;
use super::path::{Path, PathArgument};
use super::snapshot::DataTreeSnapshot;
use super::validation::check_written_node;

/// One recorded operation.
#[derive(Clone, Debug)]
pub(crate) enum Op {
    Write(Node),
    Merge(Node),
    Delete,
}

/// Effective operation recorded at one node of the terminal tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// No operation here, only below.
    Touch,
    Write,
    Merge,
    Delete,
}

#[derive(Clone, Debug)]
pub(crate) struct OpNode {
    pub(crate) kind: OpKind,
    pub(crate) children: BTreeMap<PathArgument, OpNode>,
    /// Accumulated payload of the merges recorded here.
    pub(crate) merged: Option<Node>,
}

impl OpNode {
    fn touch() -> Self {
        Self {
            kind: OpKind::Touch,
            children: BTreeMap::new(),
            merged: None,
        }
    }

    /// Record `op` at the relative path `args`.
    fn record(&mut self, args: &[PathArgument], op: &Op) {
        let Some((first, rest)) = args.split_first() else {
            match (self.kind, op) {
                (_, Op::Write(_)) | (OpKind::Write, Op::Merge(_)) => self.replace(OpKind::Write),
                (_, Op::Delete) => self.replace(OpKind::Delete),
                (OpKind::Delete, Op::Merge(_)) => self.replace(OpKind::Write),
                (OpKind::Touch | OpKind::Merge, Op::Merge(node)) => {
                    self.kind = OpKind::Merge;
                    self.merged = Some(match &self.merged {
                        Some(previous) => previous.merge(node),
                        None => node.clone(),
                    });
                }
            }
            return;
        };
        if matches!(self.kind, OpKind::Write | OpKind::Delete) {
            // Covered by the operation recorded here.
            return;
        }
        self.children
            .entry(first.clone())
            .or_insert_with(OpNode::touch)
            .record(rest, op);
    }

    fn replace(&mut self, kind: OpKind) {
        self.kind = kind;
        self.children.clear();
        self.merged = None;
    }
}

/// Everything a data tree needs to validate and apply a sealed modification.
pub(crate) struct SealedModification {
    pub(crate) shared: Arc<TreeShared>,
    pub(crate) base_root: Node,
    pub(crate) base_version: u64,
    pub(crate) after_root: Node,
    pub(crate) ops: Arc<Vec<(Path, Op)>>,
    pub(crate) terminals: OpNode,
}

/// Apply one operation at `path` to `root` and return the new root.
pub(crate) fn apply_op(root: &Node, path: &Path, op: &Op) -> Result<Node> {
    if path.is_root() {
        return Ok(match op {
            Op::Write(node) => node.clone(),
            Op::Merge(node) => root.merge(node),
            Op::Delete => Node::empty_root(),
        });
    }
    apply_below(root, path.args(), op, path)
}

fn apply_below(parent: &Node, args: &[PathArgument], op: &Op, path: &Path) -> Result<Node> {
    let Some((first, rest)) = args.split_first() else {
        return Ok(parent.clone());
    };

    if rest.is_empty() {
        let next = match (op, parent.child(first)) {
            (Op::Delete, _) => return Ok(parent.without_child(first)),
            (Op::Write(node), _) => node.clone(),
            (Op::Merge(node), Some(existing)) => existing.merge(node),
            (Op::Merge(node), None) => node.clone(),
        };
        if !parent.accepts_child(first) {
            return Err(StoreError::IllegalArgument(format!(
                "{first} cannot be placed at {path}"
            )));
        }
        if parent.child(first).is_some_and(|existing| Node::ptr_eq(existing, &next)) {
            return Ok(parent.clone());
        }
        return Ok(parent.with_child(next));
    }

    match parent.child(first) {
        Some(child) => {
            let updated = apply_below(child, rest, op, path)?;
            if Node::ptr_eq(child, &updated) {
                Ok(parent.clone())
            } else {
                Ok(parent.with_child(updated))
            }
        }
        None if matches!(op, Op::Delete) => Ok(parent.clone()),
        None => Err(StoreError::MissingParent(path.clone())),
    }
}

/// A mutable overlay on top of a snapshot.
pub struct DataTreeModification {
    base: DataTreeSnapshot,
    root: Node,
    ops: Vec<(Path, Op)>,
    terminals: OpNode,
    sealed: Option<DataTreeCandidate>,
}

impl DataTreeModification {
    pub(crate) fn new(base: DataTreeSnapshot) -> Self {
        let root = base.root().clone();
        Self {
            base,
            root,
            ops: Vec::new(),
            terminals: OpNode::touch(),
            sealed: None,
        }
    }

    /// Snapshot this modification was opened against.
    pub fn base(&self) -> &DataTreeSnapshot {
        &self.base
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Number of recorded operations.
    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Read through the modification.
    pub fn read(&self, path: &Path) -> Result<Option<Node>> {
        let path = self.base.shared().normalize_path(path)?;
        Ok(self.root.find(path.args()).cloned())
    }

    /// Replace the node at `path`.
    pub fn write(&mut self, path: &Path, node: Node) -> Result<()> {
        let (path, node) = self.prepare_node(path, node)?;
        self.record(path, Op::Write(node))
    }

    /// Structurally merge `node` into the node at `path`.
    pub fn merge(&mut self, path: &Path, node: Node) -> Result<()> {
        let (path, node) = self.prepare_node(path, node)?;
        self.record(path, Op::Merge(node))
    }

    /// Remove the node at `path`. Removing an absent node is a no-op.
    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.check_open()?;
        let path = self.base.shared().normalize_path(path)?;
        if path.has_wildcards() {
            return Err(StoreError::IllegalArgument(format!(
                "wildcard path {path} cannot be deleted"
            )));
        }
        self.record(path, Op::Delete)
    }

    /// Seal the modification and compute its candidate against the base snapshot.
    pub fn ready(&mut self) -> Result<DataTreeCandidate> {
        if self.sealed.is_some() {
            return Err(StoreError::TransactionSealed(
                "modification is already ready".to_string(),
            ));
        }
        let sealed = Arc::new(SealedModification {
            shared: self.base.shared().clone(),
            base_root: self.base.root().clone(),
            base_version: self.base.version(),
            after_root: self.root.clone(),
            ops: Arc::new(self.ops.clone()),
            terminals: self.terminals.clone(),
        });
        let candidate = DataTreeCandidate::from_sealed(sealed);
        self.sealed = Some(candidate.clone());
        Ok(candidate)
    }

    /// Snapshot of the data as this modification sees it.
    ///
    /// Used to open the next transaction of a chain on top of uncommitted data.
    pub fn snapshot(&self) -> DataTreeSnapshot {
        self.base.derive(self.root.clone())
    }

    fn check_open(&self) -> Result<()> {
        if self.sealed.is_some() {
            return Err(StoreError::TransactionSealed(
                "modification is already ready".to_string(),
            ));
        }
        Ok(())
    }

    fn prepare_node(&self, path: &Path, node: Node) -> Result<(Path, Node)> {
        self.check_open()?;
        let shared = self.base.shared();
        let path = shared.normalize_path(path)?;
        check_written_node(&path, &node)?;
        shared.validate(&path, &node)?;
        Ok((path, shared.intern(node)))
    }

    fn record(&mut self, path: Path, op: Op) -> Result<()> {
        self.root = apply_op(&self.root, &path, &op)?;
        trace!(path = %path, op = ?op_name(&op), "recorded operation");
        self.terminals.record(path.args(), &op);
        self.ops.push((path, op));
        Ok(())
    }
}

fn op_name(op: &Op) -> &'static str {
    match op {
        Op::Write(_) => "write",
        Op::Merge(_) => "merge",
        Op::Delete => "delete",
    }
}

impl std::fmt::Debug for DataTreeModification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTreeModification")
            .field("base_version", &self.base.version())
            .field("operations", &self.ops.len())
            .field("sealed", &self.sealed.is_some())
            .finish()
    }
}
