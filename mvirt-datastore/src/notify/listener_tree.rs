//! Registrations indexed by path.
//!
//! Registrations live at the node of a tree keyed by path argument, wildcard
//! arguments included. Publishing a candidate walks this tree in lockstep with
//! the candidate and only visits branches the candidate modified.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::trace;

use crate::tree::{DataTreeCandidate, DataTreeCandidateNode, Path, PathArgument};

use super::event::{DataChangeEvent, DataChangeScope};
use super::queue::Notification;

/// What a registration wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    DataChange(DataChangeScope),
    DataTree,
}

impl Interest {
    /// Build the notification for the matched candidate subtrees, if anything changed.
    pub(crate) fn notification(&self, matches: Vec<DataTreeCandidate>) -> Option<Notification> {
        match self {
            Interest::DataChange(scope) => {
                let mut merged: Option<DataChangeEvent> = None;
                for m in &matches {
                    let Some(event) =
                        DataChangeEvent::from_candidate(m.root_path(), m.root_node(), *scope)
                    else {
                        continue;
                    };
                    match merged.as_mut() {
                        Some(acc) => acc.merge(event),
                        None => merged = Some(event),
                    }
                }
                merged.map(Notification::DataChanged)
            }
            Interest::DataTree if matches.is_empty() => None,
            Interest::DataTree => Some(Notification::TreeChanged(matches)),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Registered {
    pub(crate) id: u64,
    pub(crate) interest: Interest,
    pub(crate) queue: mpsc::UnboundedSender<Notification>,
}

#[derive(Default)]
struct ListenerNode {
    registrations: Vec<Registered>,
    children: BTreeMap<PathArgument, ListenerNode>,
}

impl ListenerNode {
    fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.children.is_empty()
    }

    fn remove(&mut self, args: &[PathArgument], id: u64) -> bool {
        let Some((first, rest)) = args.split_first() else {
            let before = self.registrations.len();
            self.registrations.retain(|r| r.id != id);
            return self.registrations.len() != before;
        };
        let Some(child) = self.children.get_mut(first) else {
            return false;
        };
        let removed = child.remove(rest, id);
        if child.is_empty() {
            self.children.remove(first);
        }
        removed
    }

    fn collect<'a>(
        &'a self,
        node: &DataTreeCandidateNode,
        path: &Path,
        out: &mut BTreeMap<u64, (&'a Registered, Vec<DataTreeCandidate>)>,
    ) {
        for registered in &self.registrations {
            out.entry(registered.id)
                .or_insert_with(|| (registered, Vec::new()))
                .1
                .push(DataTreeCandidate::new(path.clone(), node.clone()));
        }
        for (arg, listeners) in &self.children {
            if arg.is_wildcard() {
                for child in node.children() {
                    if arg.matches(child.identifier()) {
                        let child_path = path.child(child.identifier().clone());
                        listeners.collect(&child, &child_path, out);
                    }
                }
            } else if let Some(child) = node.child(arg).filter(DataTreeCandidateNode::is_modified) {
                listeners.collect(&child, &path.child(arg.clone()), out);
            }
        }
    }

    fn count(&self) -> usize {
        self.registrations.len() + self.children.values().map(ListenerNode::count).sum::<usize>()
    }
}

/// All registrations of one store.
#[derive(Default)]
pub(crate) struct ListenerTree {
    root: ListenerNode,
    next_id: u64,
}

impl ListenerTree {
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn insert(&mut self, path: &Path, registered: Registered) {
        let mut node = &mut self.root;
        for arg in path.args() {
            node = node.children.entry(arg.clone()).or_default();
        }
        node.registrations.push(registered);
    }

    pub(crate) fn remove(&mut self, path: &Path, id: u64) -> bool {
        self.root.remove(path.args(), id)
    }

    pub(crate) fn len(&self) -> usize {
        self.root.count()
    }

    /// Queue one notification per interested registration for a commit candidate
    /// rooted at the tree root.
    pub(crate) fn publish(&self, candidate: &DataTreeCandidate) {
        if candidate.is_empty() || self.root.is_empty() {
            return;
        }
        debug_assert!(candidate.root_path().is_root());
        let mut matched = BTreeMap::new();
        self.root
            .collect(candidate.root_node(), candidate.root_path(), &mut matched);

        for (id, (registered, matches)) in matched {
            let Some(notification) = registered.interest.notification(matches) else {
                continue;
            };
            trace!(registration = id, "queueing notification");
            // A closed receiver means the registration is shutting down.
            let _ = registered.queue.send(notification);
        }
    }
}
