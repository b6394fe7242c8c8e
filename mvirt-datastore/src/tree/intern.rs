//! Leaf interning.
//!
//! Written leaves are looked up by content hash in a bounded LRU table so that
//! equal leaves written by different transactions share one allocation. Shared
//! allocations make the identity fast path in node comparison hit more often.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::node::Node;

/// Bounded table of recently written leaves.
pub struct NodeInterner {
    cache: Mutex<LruCache<u64, Node>>,
}

impl NodeInterner {
    /// Create an interner holding at most `capacity` leaves. Returns `None` for zero.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Return the canonical handle for a leaf equal to `leaf`.
    pub fn intern_leaf(&self, leaf: &Node) -> Node {
        if !leaf.is_leaf() {
            return leaf.clone();
        }
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&leaf.content_hash()) {
            if existing == leaf {
                return existing.clone();
            }
        }
        cache.put(leaf.content_hash(), leaf.clone());
        leaf.clone()
    }

    /// Intern every leaf below `node`.
    pub fn intern(&self, node: &Node) -> Node {
        node.map_leaves(&mut |leaf| self.intern_leaf(leaf))
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl std::fmt::Debug for NodeInterner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInterner")
            .field("len", &self.len())
            .finish()
    }
}
