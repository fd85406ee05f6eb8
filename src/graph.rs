//! The node graph: every entry known to an evaluator, keyed by interned key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use papaya::HashMap;

use crate::key::NodeKey;
use crate::node::{NodeEntry, NodeState, Version};

/// Concurrent map from key to node entry plus the logical clock.
///
/// Entries are created on first request and live as long as the graph.
/// Edges between entries are stored as keys, never as entry references.
pub struct NodeGraph {
    nodes: HashMap<NodeKey, Arc<NodeEntry>, ahash::RandomState>,
    clock: AtomicU64,
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::with_hasher(ahash::RandomState::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Returns the entry for `key`, creating a `New` one if absent.
    ///
    /// Concurrent callers for the same key all receive the same entry.
    pub fn get_or_create(&self, key: &NodeKey) -> Arc<NodeEntry> {
        let nodes = self.nodes.pin();
        if let Some(entry) = nodes.get(key) {
            return entry.clone();
        }
        nodes
            .get_or_insert_with(key.clone(), || Arc::new(NodeEntry::new(key.clone())))
            .clone()
    }

    /// Returns the entry for `key` if it exists.
    pub fn get(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        self.nodes.pin().get(key).cloned()
    }

    /// Returns true if the graph has an entry for `key`.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.pin().contains_key(key)
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.pin().keys().cloned().collect()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<Arc<NodeEntry>> {
        self.nodes.pin().values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.pin().len()
    }

    /// Returns true if the graph has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every node waiting for re-validation or recomputation.
    pub fn dirty_keys(&self) -> Vec<NodeKey> {
        self.nodes
            .pin()
            .values()
            .filter(|entry| {
                matches!(
                    entry.state(),
                    NodeState::Dirty | NodeState::ChangedPendingRecompute
                )
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Allocate a fresh version, greater than any handed out or observed before.
    pub fn next_version(&self) -> Version {
        Version(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The latest version handed out or observed.
    pub fn current_version(&self) -> Version {
        Version(self.clock.load(Ordering::SeqCst))
    }

    /// Advance the clock past a version that came from outside this graph.
    pub(crate) fn observe_version(&self, version: Version) {
        self.clock.fetch_max(version.0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("len", &self.len())
            .field("version", &self.current_version())
            .finish()
    }
}
