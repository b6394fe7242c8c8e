//! Hierarchical addressing: names, path arguments and paths.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::node::Value;

/// Name of a data node (container, leaf, list, ...).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub fn new(name: impl AsRef<str>) -> Self {
        Name(Arc::from(name.as_ref()))
    }

    /// Name of the tree root container.
    pub fn root() -> Self {
        Name(Arc::from(""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::new(s)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name(Arc::from(s))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Key values identifying one entry of a keyed list.
pub type Keys = Arc<BTreeMap<Name, Value>>;

/// One segment of a [`Path`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum PathArgument {
    /// A named node: container, leaf, list or choice.
    Node(Name),
    /// One entry of a keyed list.
    Entry { name: Name, keys: Keys },
    /// Matches every entry of the named list. Only valid in listener and cohort registrations.
    Wildcard(Name),
}

impl PathArgument {
    /// Build a list-entry argument from key/value pairs.
    pub fn entry<I, K, V>(name: impl Into<Name>, keys: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Name>,
        V: Into<Value>,
    {
        PathArgument::Entry {
            name: name.into(),
            keys: Arc::new(
                keys.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn name(&self) -> &Name {
        match self {
            PathArgument::Node(name)
            | PathArgument::Entry { name, .. }
            | PathArgument::Wildcard(name) => name,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, PathArgument::Wildcard(_))
    }

    /// Whether this (possibly wildcarded) argument matches a concrete argument.
    pub fn matches(&self, concrete: &PathArgument) -> bool {
        match self {
            PathArgument::Wildcard(name) => {
                matches!(concrete, PathArgument::Entry { name: n, .. } if n == name)
            }
            other => other == concrete,
        }
    }
}

impl From<&str> for PathArgument {
    fn from(s: &str) -> Self {
        PathArgument::Node(Name::new(s))
    }
}

impl From<Name> for PathArgument {
    fn from(name: Name) -> Self {
        PathArgument::Node(name)
    }
}

impl fmt::Display for PathArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathArgument::Node(name) => write!(f, "{name}"),
            PathArgument::Entry { name, keys } => {
                write!(f, "{name}[")?;
                for (i, (k, v)) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("]")
            }
            PathArgument::Wildcard(name) => write!(f, "{name}[*]"),
        }
    }
}

/// Absolute path of a node inside a data tree. The empty path addresses the root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    args: Arc<[PathArgument]>,
}

impl Path {
    pub fn root() -> Self {
        Path {
            args: Arc::from(Vec::new()),
        }
    }

    pub fn builder() -> PathBuilder {
        PathBuilder::default()
    }

    /// Path made of plain node names, e.g. `Path::from_names(["test", "outer"])`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|n| PathArgument::Node(Name::new(n)))
            .collect()
    }

    pub fn is_root(&self) -> bool {
        self.args.is_empty()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn args(&self) -> &[PathArgument] {
        &self.args
    }

    pub fn last(&self) -> Option<&PathArgument> {
        self.args.last()
    }

    pub fn parent(&self) -> Option<Path> {
        if self.args.is_empty() {
            return None;
        }
        Some(self.args[..self.args.len() - 1].iter().cloned().collect())
    }

    /// New path with `arg` appended.
    pub fn child(&self, arg: impl Into<PathArgument>) -> Path {
        let mut args = self.args.to_vec();
        args.push(arg.into());
        Path {
            args: Arc::from(args),
        }
    }

    /// New path with the relative arguments appended.
    pub fn join(&self, relative: &[PathArgument]) -> Path {
        let mut args = self.args.to_vec();
        args.extend_from_slice(relative);
        Path {
            args: Arc::from(args),
        }
    }

    /// True if `self` is a prefix of `other` (a path is its own prefix).
    pub fn contains(&self, other: &Path) -> bool {
        other.args.len() >= self.args.len() && other.args[..self.args.len()] == self.args[..]
    }

    /// Arguments of `self` below `ancestor`, if `ancestor` is a prefix.
    pub fn relative_to(&self, ancestor: &Path) -> Option<&[PathArgument]> {
        if ancestor.contains(self) {
            Some(&self.args[ancestor.args.len()..])
        } else {
            None
        }
    }

    pub fn has_wildcards(&self) -> bool {
        self.args.iter().any(PathArgument::is_wildcard)
    }

    /// Whether this pattern path matches a concrete path of the same length.
    pub fn matches(&self, concrete: &Path) -> bool {
        self.args.len() == concrete.args.len()
            && self
                .args
                .iter()
                .zip(concrete.args.iter())
                .all(|(p, c)| p.matches(c))
    }
}

impl FromIterator<PathArgument> for Path {
    fn from_iter<T: IntoIterator<Item = PathArgument>>(iter: T) -> Self {
        Path {
            args: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            return f.write_str("/");
        }
        for arg in self.args.iter() {
            write!(f, "/{arg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

/// Builder for [`Path`].
#[derive(Default, Debug, Clone)]
pub struct PathBuilder {
    args: Vec<PathArgument>,
}

impl PathBuilder {
    pub fn node(mut self, name: impl Into<Name>) -> Self {
        self.args.push(PathArgument::Node(name.into()));
        self
    }

    pub fn entry<I, K, V>(mut self, name: impl Into<Name>, keys: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Name>,
        V: Into<Value>,
    {
        self.args.push(PathArgument::entry(name, keys));
        self
    }

    pub fn wildcard(mut self, name: impl Into<Name>) -> Self {
        self.args.push(PathArgument::Wildcard(name.into()));
        self
    }

    pub fn arg(mut self, arg: PathArgument) -> Self {
        self.args.push(arg);
        self
    }

    pub fn build(self) -> Path {
        self.args.into_iter().collect()
    }
}
