//! Invalidation: marking changed nodes and dirtying everything that can
//! observe them.
//!
//! Dirtying is an over-approximation. The next evaluation narrows it down:
//! a dirty node first re-checks its dependencies and only recomputes if one of
//! them got a new version (see the scheduler's change pruning).

use std::collections::HashSet;

use crate::error::EvalError;
use crate::graph::NodeGraph;
use crate::key::NodeKey;
use crate::node::{Dependencies, NodeState};
use crate::persist::{NodeCache, PersistedNode};
use crate::tracer::{InvalidationReason, Tracer};
use crate::value::Value;

/// Applies changes to the graph. Callers hold the evaluator's exclusive lock.
pub(crate) struct Invalidator<'a> {
    graph: &'a NodeGraph,
    tracer: &'a dyn Tracer,
}

impl<'a> Invalidator<'a> {
    pub fn new(graph: &'a NodeGraph, tracer: &'a dyn Tracer) -> Self {
        Self { graph, tracer }
    }

    /// Mark `changed` as `ChangedPendingRecompute` and everything reachable
    /// over reverse edges as `Dirty`.
    pub fn invalidate<I>(&self, changed: I)
    where
        I: IntoIterator<Item = NodeKey>,
    {
        let mut worklist = Vec::new();
        for key in changed {
            let entry = self.graph.get_or_create(&key);
            let dependents = entry.lock().mark_changed();
            self.tracer.on_node_invalidated(&key, InvalidationReason::Changed);
            worklist.extend(dependents.into_iter().flatten());
        }
        self.dirty(worklist);
    }

    /// Set `key` to `value` as a done node without dependencies.
    pub fn inject(&self, key: &NodeKey, value: Value, cache: &dyn NodeCache) {
        let entry = self.graph.get_or_create(key);
        let (dependents, obsolete, version) = {
            let mut data = entry.lock();
            let changed = data.error.is_some()
                || data.value.as_ref().map_or(true, |old| !old.value_eq(&value));
            if changed {
                data.version = self.graph.next_version();
            }
            data.value = Some(value.clone());
            data.error = None;
            data.deps = Dependencies::default();
            data.injected = true;
            data.state = NodeState::Done;
            let obsolete: Vec<NodeKey> = data.rdep_claims.drain().collect();
            let dependents: Vec<NodeKey> = if changed {
                data.reverse_deps.iter().cloned().collect()
            } else {
                Vec::new()
            };
            (dependents, obsolete, data.version)
        };
        for dep in obsolete {
            if let Some(dep_entry) = self.graph.get(&dep) {
                dep_entry.lock().reverse_deps.remove(key);
            }
        }
        self.tracer.on_node_invalidated(key, InvalidationReason::Injected);
        cache.store(
            key,
            &PersistedNode {
                value,
                deps: Dependencies::default(),
                version,
            },
        );
        self.dirty(dependents);
    }

    /// Invalidate every done node holding a domain error.
    pub fn invalidate_errors(&self) -> Vec<NodeKey> {
        let failed: Vec<NodeKey> = self
            .graph
            .entries()
            .into_iter()
            .filter(|entry| {
                let data = entry.lock();
                data.state == NodeState::Done && matches!(data.error, Some(EvalError::Domain(_)))
            })
            .map(|entry| entry.key().clone())
            .collect();
        self.invalidate(failed.iter().cloned());
        failed
    }

    fn dirty(&self, mut worklist: Vec<NodeKey>) {
        let mut seen: HashSet<NodeKey, ahash::RandomState> = HashSet::default();
        while let Some(key) = worklist.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            let entry = self.graph.get(&key);
            debug_assert!(
                entry.is_some(),
                "reverse edge to {key:?}, which is missing from the graph"
            );
            let Some(entry) = entry else {
                continue;
            };
            let dependents = entry.lock().mark_dirty();
            if let Some(dependents) = dependents {
                self.tracer.on_node_invalidated(&key, InvalidationReason::DependencyDirty);
                worklist.extend(dependents);
            }
        }
    }
}
