//! Versioned data tree.
//!
//! The tree holds one immutable root plus a version behind an `ArcSwap`.
//! Readers load the current state without locking. Committing a candidate
//! rebases it onto the current root if the tree moved since the candidate's
//! base was captured, then installs the result with a single
//! compare-and-swap. Each successful commit bumps the version by exactly one.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, trace};

use crate::config::DatastoreConfig;
use crate::error::{Result, StoreError};

use super::candidate::{DataTreeCandidate, DataTreeCandidateNode};
use super::intern::NodeInterner;
use super::modification::{apply_op, Op, OpKind, OpNode, SealedModification};
use super::node::Node;
use super::path::Path;
use super::snapshot::DataTreeSnapshot;
use super::validation::{AcceptAll, ValidationContext};

/// State shared by a tree and every snapshot and modification derived from it.
pub(crate) struct TreeShared {
    name: String,
    validation: ArcSwap<Box<dyn ValidationContext>>,
    interner: Option<NodeInterner>,
}

impl TreeShared {
    pub(crate) fn normalize_path(&self, path: &Path) -> Result<Path> {
        self.validation.load().normalize_path(path)
    }

    pub(crate) fn validate(&self, path: &Path, node: &Node) -> Result<()> {
        self.validation.load().validate(path, node)
    }

    pub(crate) fn intern(&self, node: Node) -> Node {
        match &self.interner {
            Some(interner) => interner.intern(&node),
            None => node,
        }
    }
}

struct TreeState {
    root: Node,
    version: u64,
}

/// A candidate validated against a specific tree state, ready to be committed.
pub struct PreparedCommit {
    sealed: Arc<SealedModification>,
    prepared_on: Arc<TreeState>,
    new_root: Node,
}

impl PreparedCommit {
    /// Root the tree will have once this commit is installed.
    pub fn new_root(&self) -> &Node {
        &self.new_root
    }
}

impl std::fmt::Debug for PreparedCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCommit")
            .field("base_version", &self.sealed.base_version)
            .field("prepared_on", &self.prepared_on.version)
            .finish()
    }
}

/// Outcome of installing a prepared commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// Snapshot of the new tree state.
    pub snapshot: DataTreeSnapshot,
    /// Changes relative to the state the commit was installed on.
    pub candidate: DataTreeCandidate,
}

/// A versioned, copy-on-write data tree.
pub struct DataTree {
    state: ArcSwap<TreeState>,
    shared: Arc<TreeShared>,
}

impl DataTree {
    /// Tree that accepts any data and does not intern leaves.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_validation(name, Box::new(AcceptAll), &DatastoreConfig {
            leaf_intern_cache_size: 0,
            ..DatastoreConfig::default()
        })
    }

    pub fn with_validation(
        name: impl Into<String>,
        validation: Box<dyn ValidationContext>,
        config: &DatastoreConfig,
    ) -> Self {
        Self {
            state: ArcSwap::from_pointee(TreeState {
                root: Node::empty_root(),
                version: 0,
            }),
            shared: Arc::new(TreeShared {
                name: name.into(),
                validation: ArcSwap::from_pointee(validation),
                interner: NodeInterner::new(config.leaf_intern_cache_size),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn version(&self) -> u64 {
        self.state.load().version
    }

    /// Capture the current state.
    pub fn snapshot(&self) -> DataTreeSnapshot {
        let state = self.state.load();
        DataTreeSnapshot::new(state.root.clone(), state.version, self.shared.clone())
    }

    /// Replace the validation context. Applies to operations and commits that start afterwards.
    pub fn set_validation_context(&self, validation: Box<dyn ValidationContext>) {
        debug!(tree = %self.shared.name, context = validation.name(), "validation context updated");
        self.shared.validation.store(Arc::new(validation));
    }

    /// Current validation context.
    pub fn validation_context(&self) -> Arc<Box<dyn ValidationContext>> {
        self.shared.validation.load_full()
    }

    /// Check that `candidate` could be committed right now.
    pub fn validate(&self, candidate: &DataTreeCandidate) -> Result<()> {
        self.prepare(candidate).map(|_| ())
    }

    /// Validate `candidate` and compute the resulting root.
    pub fn prepare(&self, candidate: &DataTreeCandidate) -> Result<PreparedCommit> {
        let sealed = self.sealed_of(candidate)?;
        let current = self.state.load_full();
        let new_root = self.rebase(&sealed, &current)?;
        self.check_context(&sealed, &new_root)?;
        Ok(PreparedCommit {
            sealed,
            prepared_on: current,
            new_root,
        })
    }

    /// Install a prepared commit.
    ///
    /// If another commit landed since `prepare`, the modification is rebased
    /// again and may fail with an optimistic lock error.
    pub fn commit(&self, prepared: PreparedCommit) -> Result<CommitResult> {
        let PreparedCommit {
            sealed,
            mut prepared_on,
            mut new_root,
        } = prepared;

        loop {
            let current = self.state.load_full();
            if !Arc::ptr_eq(&current, &prepared_on) {
                new_root = self.rebase(&sealed, &current)?;
                self.check_context(&sealed, &new_root)?;
                prepared_on = current.clone();
            }

            let next = Arc::new(TreeState {
                root: new_root.clone(),
                version: current.version + 1,
            });
            let previous = self.state.compare_and_swap(&current, next.clone());
            if !Arc::ptr_eq(&*previous, &current) {
                trace!(tree = %self.shared.name, "lost commit race, retrying");
                continue;
            }

            debug!(tree = %self.shared.name, version = next.version, "committed new root");
            let root = DataTreeCandidateNode::from_op(
                current.root.identifier().clone(),
                &sealed.terminals,
                Some(&current.root),
                Some(&next.root),
            );
            return Ok(CommitResult {
                snapshot: DataTreeSnapshot::new(
                    next.root.clone(),
                    next.version,
                    self.shared.clone(),
                ),
                candidate: DataTreeCandidate::new(Path::root(), root),
            });
        }
    }

    /// Prepare and commit in one step.
    pub fn apply(&self, candidate: &DataTreeCandidate) -> Result<DataTreeSnapshot> {
        let prepared = self.prepare(candidate)?;
        Ok(self.commit(prepared)?.snapshot)
    }

    fn sealed_of(&self, candidate: &DataTreeCandidate) -> Result<Arc<SealedModification>> {
        candidate
            .sealed()
            .filter(|sealed| Arc::ptr_eq(&sealed.shared, &self.shared))
            .cloned()
            .ok_or_else(|| {
                StoreError::IllegalArgument(format!(
                    "candidate was not produced by a modification of tree {}",
                    self.shared.name
                ))
            })
    }

    fn rebase(&self, sealed: &SealedModification, current: &TreeState) -> Result<Node> {
        if Node::ptr_eq(&current.root, &sealed.base_root) {
            return Ok(sealed.after_root.clone());
        }
        debug!(
            tree = %self.shared.name,
            base_version = sealed.base_version,
            current_version = current.version,
            "rebasing modification onto newer root"
        );

        check_conflicts(
            &sealed.terminals,
            &Path::root(),
            Some(&sealed.base_root),
            Some(&current.root),
        )?;

        let mut root = current.root.clone();
        for (path, op) in sealed.ops.iter() {
            root = apply_op(&root, path, op).map_err(|e| StoreError::OptimisticLockFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(root)
    }

    fn check_context(&self, sealed: &SealedModification, new_root: &Node) -> Result<()> {
        let validation = self.shared.validation.load();
        for (path, op) in sealed.ops.iter() {
            if matches!(op, Op::Delete) {
                continue;
            }
            if let Some(node) = new_root.find(path.args()) {
                validation.validate(path, node)?;
            }
        }
        Ok(())
    }
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new("default")
    }
}

impl std::fmt::Debug for DataTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTree")
            .field("name", &self.shared.name)
            .field("version", &self.version())
            .finish()
    }
}

/// Walk the terminal operations and compare the base and current node at each.
///
/// Write and delete need the node unchanged since the base. A merge only
/// needs the nodes it merges into unchanged: composite nodes are checked
/// child by child along the merged payload, so merges of disjoint children
/// into a node changed by someone else still apply.
fn check_conflicts(
    op: &OpNode,
    path: &Path,
    base: Option<&Node>,
    current: Option<&Node>,
) -> Result<()> {
    match op.kind {
        OpKind::Touch => check_children(op, path, base, current),
        OpKind::Write | OpKind::Delete => same_or_conflict(path, base, current),
        OpKind::Merge => {
            if let Some(merged) = &op.merged {
                check_merge(merged, path, base, current)?;
            }
            check_children(op, path, base, current)
        }
    }
}

fn check_children(
    op: &OpNode,
    path: &Path,
    base: Option<&Node>,
    current: Option<&Node>,
) -> Result<()> {
    if let (Some(b), Some(c)) = (base, current) {
        if Node::ptr_eq(b, c) {
            return Ok(());
        }
    }
    for (id, child) in &op.children {
        check_conflicts(
            child,
            &path.child(id.clone()),
            base.and_then(|n| n.child(id)),
            current.and_then(|n| n.child(id)),
        )?;
    }
    Ok(())
}

fn check_merge(
    merged: &Node,
    path: &Path,
    base: Option<&Node>,
    current: Option<&Node>,
) -> Result<()> {
    let (Some(b), Some(c)) = (base, current) else {
        // A node created since the base is merged into. A deleted one is not.
        return match base {
            None => Ok(()),
            Some(_) => same_or_conflict(path, base, current),
        };
    };
    if b == c {
        return Ok(());
    }
    if !(merged.merges_into(b) && merged.merges_into(c)) {
        return same_or_conflict(path, base, current);
    }
    for (id, child) in merged.children().into_iter().flatten() {
        check_merge(child, &path.child(id.clone()), b.child(id), c.child(id))?;
    }
    Ok(())
}

fn same_or_conflict(path: &Path, base: Option<&Node>, current: Option<&Node>) -> Result<()> {
    let reason = match (base, current) {
        (None, None) => return Ok(()),
        (Some(b), Some(c)) if b == c => return Ok(()),
        (None, Some(_)) => "node was created by another transaction",
        (Some(_), None) => "node was deleted by another transaction",
        (Some(_), Some(_)) => "node was modified by another transaction",
    };
    Err(StoreError::OptimisticLockFailed {
        path: path.clone(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{FnValidation, ModificationType, PathArgument, Value};

    fn test_path() -> Path {
        Path::from_names(["test"])
    }

    fn tree_with_test() -> DataTree {
        let tree = DataTree::new("test-tree");
        let mut m = tree.snapshot().new_modification();
        m.write(&test_path(), Node::container("test").build()).unwrap();
        tree.apply(&m.ready().unwrap()).unwrap();
        tree
    }

    #[test]
    fn test_version_bumps_once_per_commit() {
        let tree = tree_with_test();
        assert_eq!(tree.version(), 1);

        let mut m = tree.snapshot().new_modification();
        let candidate = m.ready().unwrap();
        tree.apply(&candidate).unwrap();
        assert_eq!(tree.version(), 2);
    }

    #[test]
    fn test_snapshots_are_isolated() {
        let tree = tree_with_test();
        let before = tree.snapshot();

        let mut m = tree.snapshot().new_modification();
        m.delete(&test_path()).unwrap();
        tree.apply(&m.ready().unwrap()).unwrap();

        assert!(before.read(&test_path()).is_some());
        assert!(tree.snapshot().read(&test_path()).is_none());
    }

    #[test]
    fn test_disjoint_concurrent_writes() {
        let tree = tree_with_test();
        let base = tree.snapshot();

        let mut m1 = base.new_modification();
        m1.write(&test_path().child("a"), Node::leaf("a", 1i64)).unwrap();
        let mut m2 = base.new_modification();
        m2.write(&test_path().child("b"), Node::leaf("b", 2i64)).unwrap();

        let c1 = m1.ready().unwrap();
        let c2 = m2.ready().unwrap();
        tree.apply(&c2).unwrap();
        tree.apply(&c1).unwrap();

        let snapshot = tree.snapshot();
        assert!(snapshot.read(&test_path().child("a")).is_some());
        assert!(snapshot.read(&test_path().child("b")).is_some());
        assert_eq!(snapshot.version(), 3);
    }

    #[test]
    fn test_same_path_conflict() {
        let tree = tree_with_test();
        let base = tree.snapshot();
        let path = test_path().child("a");

        let mut m1 = base.new_modification();
        m1.write(&path, Node::leaf("a", 1i64)).unwrap();
        let mut m2 = base.new_modification();
        m2.write(&path, Node::leaf("a", 2i64)).unwrap();

        tree.apply(&m1.ready().unwrap()).unwrap();
        let err = tree.apply(&m2.ready().unwrap()).unwrap_err();
        assert!(err.is_optimistic_conflict());

        let value = tree.snapshot().read(&path).unwrap();
        assert_eq!(value.value(), Some(&Value::Int(1)));
        assert_eq!(tree.version(), 2);
    }

    #[test]
    fn test_delete_of_concurrently_deleted_parent_conflicts() {
        let tree = tree_with_test();
        let base = tree.snapshot();

        let mut m1 = base.new_modification();
        m1.delete(&test_path()).unwrap();
        let mut m2 = base.new_modification();
        m2.write(&test_path().child("a"), Node::leaf("a", 1i64)).unwrap();

        tree.apply(&m1.ready().unwrap()).unwrap();
        let err = tree.apply(&m2.ready().unwrap()).unwrap_err();
        assert!(err.is_optimistic_conflict());
    }

    #[test]
    fn test_merge_onto_new_node_tolerates_concurrent_create() {
        let tree = tree_with_test();
        let base = tree.snapshot();
        let list_path = test_path().child("outer-list");

        let mut m1 = base.new_modification();
        m1.merge(
            &list_path,
            Node::list("outer-list")
                .with_child(Node::map_entry("outer-list", "id", 1i64))
                .build(),
        )
        .unwrap();
        let mut m2 = base.new_modification();
        m2.merge(
            &list_path,
            Node::list("outer-list")
                .with_child(Node::map_entry("outer-list", "id", 2i64))
                .build(),
        )
        .unwrap();

        tree.apply(&m1.ready().unwrap()).unwrap();
        tree.apply(&m2.ready().unwrap()).unwrap();

        let list = tree.snapshot().read(&list_path).unwrap();
        assert_eq!(list.children().unwrap().len(), 2);
    }

    #[test]
    fn test_disjoint_merges_into_existing_list() {
        let tree = tree_with_test();
        let list_path = test_path().child("outer-list");
        let list = |ids: &[i64]| {
            Node::list("outer-list")
                .with_children(ids.iter().map(|id| Node::map_entry("outer-list", "id", *id)))
                .build()
        };
        let mut m = tree.snapshot().new_modification();
        m.write(&list_path, list(&[1])).unwrap();
        tree.apply(&m.ready().unwrap()).unwrap();

        let base = tree.snapshot();
        let mut m1 = base.new_modification();
        m1.merge(&list_path, list(&[2])).unwrap();
        let mut m2 = base.new_modification();
        m2.merge(&list_path, list(&[3])).unwrap();

        tree.apply(&m1.ready().unwrap()).unwrap();
        tree.apply(&m2.ready().unwrap()).unwrap();
        assert_eq!(tree.snapshot().read(&list_path), Some(list(&[1, 2, 3])));
    }

    #[test]
    fn test_merge_over_changed_leaf_conflicts() {
        let tree = tree_with_test();
        let mut m = tree.snapshot().new_modification();
        m.write(&test_path().child("a"), Node::leaf("a", 1i64)).unwrap();
        tree.apply(&m.ready().unwrap()).unwrap();

        let base = tree.snapshot();
        let mut m1 = base.new_modification();
        m1.write(&test_path().child("a"), Node::leaf("a", 2i64)).unwrap();
        let mut m2 = base.new_modification();
        m2.merge(
            &test_path(),
            Node::container("test").with_leaf("a", 3i64).build(),
        )
        .unwrap();

        tree.apply(&m1.ready().unwrap()).unwrap();
        let err = tree.apply(&m2.ready().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::OptimisticLockFailed { ref path, .. } if *path == test_path().child("a")
        ));
    }

    #[test]
    fn test_merge_into_deleted_node_conflicts() {
        let tree = tree_with_test();
        let base = tree.snapshot();

        let mut m1 = base.new_modification();
        m1.delete(&test_path()).unwrap();
        let mut m2 = base.new_modification();
        m2.merge(
            &test_path(),
            Node::container("test").with_leaf("a", 1i64).build(),
        )
        .unwrap();

        tree.apply(&m1.ready().unwrap()).unwrap();
        assert!(tree.apply(&m2.ready().unwrap()).unwrap_err().is_optimistic_conflict());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let tree = tree_with_test();
        let node = Node::container("test").with_leaf("x", 1i64).build();

        for _ in 0..2 {
            let mut m = tree.snapshot().new_modification();
            m.merge(&test_path(), node.clone()).unwrap();
            tree.apply(&m.ready().unwrap()).unwrap();
        }
        assert_eq!(tree.snapshot().read(&test_path()), Some(node));
    }

    #[test]
    fn test_prepare_then_commit_after_intervening_commit() {
        let tree = tree_with_test();

        let mut m1 = tree.snapshot().new_modification();
        m1.write(&test_path().child("a"), Node::leaf("a", 1i64)).unwrap();
        let prepared = tree.prepare(&m1.ready().unwrap()).unwrap();

        let mut m2 = tree.snapshot().new_modification();
        m2.write(&test_path().child("b"), Node::leaf("b", 1i64)).unwrap();
        tree.apply(&m2.ready().unwrap()).unwrap();

        let result = tree.commit(prepared).unwrap();
        assert_eq!(result.snapshot.version(), 3);
        assert!(result.snapshot.read(&test_path().child("b")).is_some());

        let test = result.candidate.root_node().child(&"test".into()).unwrap();
        assert_eq!(test.modification_type(), ModificationType::SubtreeModified);
        let changed = test.children();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].identifier(), &PathArgument::from("a"));
    }

    #[test]
    fn test_foreign_candidate_rejected() {
        let tree = tree_with_test();
        let other = DataTree::new("other");
        let mut m = other.snapshot().new_modification();
        let candidate = m.ready().unwrap();
        assert!(matches!(
            tree.apply(&candidate),
            Err(StoreError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_swapped_validation_context_applies_at_commit() {
        let tree = tree_with_test();
        let mut m = tree.snapshot().new_modification();
        m.write(&test_path().child("a"), Node::leaf("a", 1i64)).unwrap();
        let candidate = m.ready().unwrap();

        tree.set_validation_context(Box::new(FnValidation::new(
            "no-a",
            |path: &Path, _node: &Node| {
                if path.last() == Some(&PathArgument::from("a")) {
                    Err("a is forbidden".to_string())
                } else {
                    Ok(())
                }
            },
        )));

        assert!(matches!(
            tree.apply(&candidate),
            Err(StoreError::DataValidationFailed { .. })
        ));
    }

    #[test]
    fn test_interning_shares_leaves() {
        let tree = DataTree::with_validation(
            "interned",
            Box::new(AcceptAll),
            &DatastoreConfig::default(),
        );
        let mut m = tree.snapshot().new_modification();
        m.write(
            &Path::from_names(["a"]),
            Node::container("a").with_leaf("v", "same").build(),
        )
        .unwrap();
        m.write(
            &Path::from_names(["b"]),
            Node::container("b").with_leaf("v", "same").build(),
        )
        .unwrap();
        let snapshot = tree.apply(&m.ready().unwrap()).unwrap();

        let a = snapshot.read(&Path::from_names(["a", "v"])).unwrap();
        let b = snapshot.read(&Path::from_names(["b", "v"])).unwrap();
        assert!(Node::ptr_eq(&a, &b));
    }
}
