//! Validation and normalization collaborator.
//!
//! The engine never interprets modeling rules. It only asks the context to
//! accept or reject a written node and to normalize incoming paths.

use crate::error::{Result, StoreError};

use super::node::Node;
use super::path::Path;

/// Structural validation supplied when a store is created; swappable at runtime.
pub trait ValidationContext: Send + Sync {
    /// Normalize a caller-supplied path. The default accepts it unchanged.
    fn normalize_path(&self, path: &Path) -> Result<Path> {
        Ok(path.clone())
    }

    /// Accept or reject `node` written at `path`.
    fn validate(&self, path: &Path, node: &Node) -> Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Context that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ValidationContext for AcceptAll {
    fn validate(&self, _path: &Path, _node: &Node) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "accept-all"
    }
}

/// Context backed by a closure, handy for tests and simple schema checks.
pub struct FnValidation<F> {
    name: String,
    check: F,
}

impl<F> FnValidation<F>
where
    F: Fn(&Path, &Node) -> std::result::Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> ValidationContext for FnValidation<F>
where
    F: Fn(&Path, &Node) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, path: &Path, node: &Node) -> Result<()> {
        (self.check)(path, node).map_err(|reason| StoreError::DataValidationFailed {
            path: path.clone(),
            reason,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Structural checks the engine always performs before handing a node to the context.
pub(crate) fn check_written_node(path: &Path, node: &Node) -> Result<()> {
    if path.has_wildcards() {
        return Err(StoreError::IllegalArgument(format!(
            "wildcard path {path} cannot be written"
        )));
    }
    match path.last() {
        Some(last) if last != node.identifier() => {
            return Err(StoreError::IllegalArgument(format!(
                "node {} does not match path {path}",
                node.identifier()
            )));
        }
        None if node.identifier() != Node::empty_root().identifier() || node.is_leaf() => {
            return Err(StoreError::IllegalArgument(
                "root must be a container named after the root".to_string(),
            ));
        }
        _ => {}
    }
    node.check_structure()
        .map_err(|reason| StoreError::DataValidationFailed {
            path: path.clone(),
            reason,
        })
}
