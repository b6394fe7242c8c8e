//! Versioned copy-on-write data tree.
//!
//! - [`Node`] and [`Path`] are immutable values shared by reference count.
//! - [`DataTree`] holds the current root and version.
//! - [`DataTreeSnapshot`] is a point-in-time view.
//! - [`DataTreeModification`] accumulates writes against a snapshot and seals
//!   into a [`DataTreeCandidate`].

mod candidate;
mod data_tree;
mod intern;
mod modification;
mod node;
mod path;
mod snapshot;
mod validation;

pub use candidate::{DataTreeCandidate, DataTreeCandidateNode, ModificationType};
pub use data_tree::{CommitResult, DataTree, PreparedCommit};
pub use intern::NodeInterner;
pub use modification::DataTreeModification;
pub use node::{ChildMap, Node, NodeBuilder, NodeKind, Value};
pub use path::{Keys, Name, Path, PathArgument, PathBuilder};
pub use snapshot::DataTreeSnapshot;
pub use validation::{AcceptAll, FnValidation, ValidationContext};
