//! Immutable data nodes.
//!
//! A [`Node`] is a cheap handle (`Arc`) to an immutable value. Containers hold
//! their children by handle, so rebuilding a parent after a child changed
//! copies one level of handles and shares every untouched subtree.
//!
//! Each node caches a content hash at construction. Equality first checks
//! identity, then the cached hash, and only then compares structure.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::path::{Name, PathArgument};

/// Scalar value carried by a leaf.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Value {
    Empty,
    Bool(bool),
    Int(i64),
    Uint(u64),
    String(Arc<str>),
    Binary(Arc<[u8]>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("[empty]"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Binary(v) => write!(f, "[{} bytes]", v.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(Arc::from(v))
    }
}

/// Children of a composite node, keyed by their identifier.
pub type ChildMap = BTreeMap<PathArgument, Node>;

/// Kind of a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Leaf,
    Container,
    /// Keyed list; children are list entries.
    List,
    ListEntry,
    /// Choice; children are the nodes of the selected case.
    Choice,
}

#[derive(PartialEq, Eq)]
enum Body {
    Leaf(Value),
    Composite(NodeKind, ChildMap),
}

struct NodeInner {
    identifier: PathArgument,
    body: Body,
    hash: u64,
}

fn header_hash(identifier: &PathArgument, kind: NodeKind) -> u64 {
    let mut hasher = DefaultHasher::new();
    identifier.hash(&mut hasher);
    kind.hash(&mut hasher);
    hasher.finish()
}

/// Spreads a child hash before it is summed into its parent's hash.
fn mix(mut h: u64) -> u64 {
    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^ (h >> 31)
}

/// Immutable, structurally comparable data node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    fn from_body(identifier: PathArgument, body: Body) -> Node {
        let hash = match &body {
            Body::Leaf(value) => {
                let mut hasher = DefaultHasher::new();
                identifier.hash(&mut hasher);
                NodeKind::Leaf.hash(&mut hasher);
                value.hash(&mut hasher);
                hasher.finish()
            }
            Body::Composite(kind, children) => children
                .values()
                .fold(header_hash(&identifier, *kind), |acc, child| {
                    acc.wrapping_add(mix(child.0.hash))
                }),
        };
        Node::with_hash(identifier, body, hash)
    }

    fn with_hash(identifier: PathArgument, body: Body, hash: u64) -> Node {
        Node(Arc::new(NodeInner {
            identifier,
            body,
            hash,
        }))
    }

    /// A leaf node.
    pub fn leaf(name: impl Into<Name>, value: impl Into<Value>) -> Node {
        Node::from_body(PathArgument::Node(name.into()), Body::Leaf(value.into()))
    }

    pub fn container(name: impl Into<Name>) -> NodeBuilder {
        NodeBuilder::new(PathArgument::Node(name.into()), NodeKind::Container)
    }

    pub fn list(name: impl Into<Name>) -> NodeBuilder {
        NodeBuilder::new(PathArgument::Node(name.into()), NodeKind::List)
    }

    pub fn choice(name: impl Into<Name>) -> NodeBuilder {
        NodeBuilder::new(PathArgument::Node(name.into()), NodeKind::Choice)
    }

    /// A list entry builder. Key leaves are added automatically.
    pub fn list_entry<I, K, V>(name: impl Into<Name>, keys: I) -> NodeBuilder
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Name>,
        V: Into<Value>,
    {
        let identifier = PathArgument::entry(name, keys);
        let mut builder = NodeBuilder::new(identifier.clone(), NodeKind::ListEntry);
        if let PathArgument::Entry { keys, .. } = &identifier {
            for (key, value) in keys.iter() {
                builder = builder.with_leaf(key.clone(), value.clone());
            }
        }
        builder
    }

    /// A list entry with a single key and no other content.
    pub fn map_entry(name: impl Into<Name>, key: impl Into<Name>, value: impl Into<Value>) -> Node {
        Node::list_entry(name, [(key.into(), value.into())]).build()
    }

    /// An empty root container.
    pub fn empty_root() -> Node {
        Node::container(Name::root()).build()
    }

    /// A composite node of the given kind.
    pub fn composite(identifier: PathArgument, kind: NodeKind, children: ChildMap) -> Node {
        debug_assert!(kind != NodeKind::Leaf);
        Node::from_body(identifier, Body::Composite(kind, children))
    }

    pub fn identifier(&self) -> &PathArgument {
        &self.0.identifier
    }

    pub fn name(&self) -> &Name {
        self.0.identifier.name()
    }

    pub fn kind(&self) -> NodeKind {
        match &self.0.body {
            Body::Leaf(_) => NodeKind::Leaf,
            Body::Composite(kind, _) => *kind,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.0.body, Body::Leaf(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.0.body {
            Body::Leaf(value) => Some(value),
            Body::Composite(..) => None,
        }
    }

    pub fn children(&self) -> Option<&ChildMap> {
        match &self.0.body {
            Body::Leaf(_) => None,
            Body::Composite(_, children) => Some(children),
        }
    }

    pub fn child(&self, id: &PathArgument) -> Option<&Node> {
        self.children().and_then(|c| c.get(id))
    }

    /// Descend along relative path arguments.
    pub fn find(&self, relative: &[PathArgument]) -> Option<&Node> {
        let mut current = self;
        for arg in relative {
            current = current.child(arg)?;
        }
        Some(current)
    }

    /// Cached content hash.
    pub fn content_hash(&self) -> u64 {
        self.0.hash
    }

    /// True if both handles point to the same allocation.
    pub fn ptr_eq(a: &Node, b: &Node) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Whether `id` may appear as a direct child of this node.
    pub fn accepts_child(&self, id: &PathArgument) -> bool {
        match self.kind() {
            NodeKind::Leaf => false,
            NodeKind::List => matches!(id, PathArgument::Entry { name, .. } if name == self.name()),
            NodeKind::Container | NodeKind::ListEntry | NodeKind::Choice => {
                matches!(id, PathArgument::Node(_))
            }
        }
    }

    /// Check that every child is keyed by its own identifier and allowed under its parent.
    pub fn check_structure(&self) -> std::result::Result<(), String> {
        if let Some(children) = self.children() {
            for (id, child) in children {
                if id != child.identifier() {
                    return Err(format!(
                        "child {} stored under {} in {}",
                        child.identifier(),
                        id,
                        self.identifier()
                    ));
                }
                if !self.accepts_child(id) {
                    return Err(format!(
                        "{:?} {} cannot contain {}",
                        self.kind(),
                        self.identifier(),
                        id
                    ));
                }
                child.check_structure()?;
            }
        }
        Ok(())
    }

    /// Same node with `child` inserted or replaced.
    ///
    /// The child map is copied one level deep. The cached hash is adjusted
    /// for the one changed child instead of being recomputed.
    pub fn with_child(&self, child: Node) -> Node {
        match &self.0.body {
            Body::Leaf(_) => self.clone(),
            Body::Composite(kind, children) => {
                let mut children = children.clone();
                let mut hash = self.0.hash.wrapping_add(mix(child.0.hash));
                if let Some(previous) = children.insert(child.identifier().clone(), child) {
                    hash = hash.wrapping_sub(mix(previous.0.hash));
                }
                Node::with_hash(
                    self.identifier().clone(),
                    Body::Composite(*kind, children),
                    hash,
                )
            }
        }
    }

    /// Same node without the child `id`.
    pub fn without_child(&self, id: &PathArgument) -> Node {
        match &self.0.body {
            Body::Composite(kind, children) => {
                let mut children = children.clone();
                match children.remove(id) {
                    Some(removed) => Node::with_hash(
                        self.identifier().clone(),
                        Body::Composite(*kind, children),
                        self.0.hash.wrapping_sub(mix(removed.0.hash)),
                    ),
                    None => self.clone(),
                }
            }
            Body::Leaf(_) => self.clone(),
        }
    }

    /// Whether merging `self` into `target` descends into children rather
    /// than replacing `target`.
    pub(crate) fn merges_into(&self, target: &Node) -> bool {
        match (&target.0.body, &self.0.body) {
            (Body::Composite(k1, _), Body::Composite(k2, _)) => {
                k1 == k2 && target.identifier() == self.identifier()
            }
            _ => false,
        }
    }

    /// Structural merge of `other` into `self`.
    ///
    /// Composite nodes of the same kind merge their children recursively,
    /// everything else is replaced by `other`. Merging content already present
    /// returns `self` unchanged.
    pub fn merge(&self, other: &Node) -> Node {
        if Node::ptr_eq(self, other) {
            return self.clone();
        }
        let (kind, children) = match &self.0.body {
            Body::Composite(kind, children) if other.merges_into(self) => (*kind, children),
            _ => return other.clone(),
        };

        let mut merged = children.clone();
        let mut changed = false;
        for (id, incoming) in other.children().into_iter().flatten() {
            let next = match children.get(id) {
                Some(existing) => existing.merge(incoming),
                None => incoming.clone(),
            };
            let same = children.get(id).is_some_and(|existing| existing == &next);
            if !same {
                merged.insert(id.clone(), next);
                changed = true;
            }
        }

        if changed {
            Node::composite(self.identifier().clone(), kind, merged)
        } else {
            self.clone()
        }
    }

    /// Rebuild the node with `map` applied to every leaf, sharing untouched subtrees.
    pub fn map_leaves(&self, map: &mut impl FnMut(&Node) -> Node) -> Node {
        match &self.0.body {
            Body::Leaf(_) => map(self),
            Body::Composite(kind, children) => {
                let mut rebuilt = ChildMap::new();
                let mut changed = false;
                for (id, child) in children {
                    let next = child.map_leaves(map);
                    changed |= !Node::ptr_eq(child, &next);
                    rebuilt.insert(id.clone(), next);
                }
                if changed {
                    Node::composite(self.identifier().clone(), *kind, rebuilt)
                } else {
                    self.clone()
                }
            }
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Node::ptr_eq(self, other)
            || (self.0.hash == other.0.hash
                && self.0.identifier == other.0.identifier
                && self.0.body == other.0.body)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.body {
            Body::Leaf(value) => write!(f, "{}={:?}", self.identifier(), value),
            Body::Composite(_, children) => {
                write!(f, "{} ", self.identifier())?;
                f.debug_list().entries(children.values()).finish()
            }
        }
    }
}

/// Builder for composite nodes.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    identifier: PathArgument,
    kind: NodeKind,
    children: ChildMap,
}

impl NodeBuilder {
    fn new(identifier: PathArgument, kind: NodeKind) -> Self {
        Self {
            identifier,
            kind,
            children: ChildMap::new(),
        }
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.insert(child.identifier().clone(), child);
        self
    }

    pub fn with_leaf(self, name: impl Into<Name>, value: impl Into<Value>) -> Self {
        self.with_child(Node::leaf(name, value))
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        for child in children {
            self.children.insert(child.identifier().clone(), child);
        }
        self
    }

    pub fn build(self) -> Node {
        Node::composite(self.identifier, self.kind, self.children)
    }
}
