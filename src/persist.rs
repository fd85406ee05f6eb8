//! Persistence boundary.
//!
//! A [`NodeCache`] lets a fresh graph start from entries computed by an
//! earlier process. The byte-level format is the implementor's concern; the
//! engine only hands over and receives [`PersistedNode`] records. A loaded
//! entry is never trusted as is: it enters the graph dirty, and its recorded
//! dependencies are re-validated before the value is used.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::key::NodeKey;
use crate::node::{Dependencies, Version};
use crate::value::Value;

/// Snapshot of a successfully computed node.
#[derive(Debug, Clone)]
pub struct PersistedNode {
    /// The value.
    pub value: Value,
    /// Dependencies read by the computation that produced the value.
    pub deps: Dependencies,
    /// Version of the value.
    pub version: Version,
}

/// Opaque get/put store for node entries.
pub trait NodeCache: Send + Sync {
    /// Look up a persisted entry. `None` is a miss.
    fn load(&self, key: &NodeKey) -> Option<PersistedNode>;

    /// Persist an entry. Called each time a node obtains a new value.
    fn store(&self, key: &NodeKey, node: &PersistedNode);

    /// The highest version among persisted entries.
    ///
    /// Versions handed out afterwards by a graph using this cache are greater,
    /// so a recomputed node never reuses a persisted version.
    fn latest_version(&self) -> Version {
        Version::default()
    }
}

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl NodeCache for NoopCache {
    fn load(&self, _key: &NodeKey) -> Option<PersistedNode> {
        None
    }

    fn store(&self, _key: &NodeKey, _node: &PersistedNode) {}
}

/// In-memory cache, usable to share entries between evaluators of one process.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    nodes: Mutex<HashMap<NodeKey, PersistedNode, ahash::RandomState>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Drop the entry for `key`.
    pub fn remove(&self, key: &NodeKey) -> Option<PersistedNode> {
        self.nodes.lock().remove(key)
    }
}

impl NodeCache for InMemoryCache {
    fn load(&self, key: &NodeKey) -> Option<PersistedNode> {
        self.nodes.lock().get(key).cloned()
    }

    fn store(&self, key: &NodeKey, node: &PersistedNode) {
        self.nodes.lock().insert(key.clone(), node.clone());
    }

    fn latest_version(&self) -> Version {
        self.nodes
            .lock()
            .values()
            .map(|node| node.version)
            .max()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Kind;

    #[test]
    fn test_in_memory_cache() {
        let cache = InMemoryCache::new();
        let key = NodeKey::new(Kind::new("CACHED"), 1_u8);
        assert!(cache.load(&key).is_none());
        assert_eq!(cache.latest_version(), Version(0));

        cache.store(
            &key,
            &PersistedNode {
                value: Value::new("v".to_string()),
                deps: Dependencies::default(),
                version: Version(9),
            },
        );
        let loaded = cache.load(&key).unwrap();
        assert_eq!(loaded.version, Version(9));
        assert_eq!(loaded.value, Value::new("v".to_string()));
        assert_eq!(cache.latest_version(), Version(9));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(&key).is_some());
        assert!(cache.is_empty());
        assert!(NoopCache.load(&key).is_none());
    }
}
