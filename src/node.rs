//! Node entries: the per-key record of state, value, and dependency edges.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard};

use crate::error::EvalError;
use crate::key::NodeKey;
use crate::value::Value;

/// Version is a logical timestamp of the last change of a node's value. Note that this does not increase one by one.
///
/// Versions come from one graph-wide clock, so a node's version only moves
/// forward, but comparing versions of different nodes carries no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(pub u64);

/// Lifecycle state of a node entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeState {
    /// Created on first request, never computed.
    New,
    /// Scheduled, running, or waiting for dependencies.
    InProgress,
    /// Holds a value or an error that is up to date.
    Done,
    /// A dependency may have changed; dependencies must be re-checked.
    Dirty,
    /// Changed directly; must be recomputed.
    ChangedPendingRecompute,
}

/// Pointer is a pair of a key and the version of its value that was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// The dependency.
    pub key: NodeKey,
    /// Version of the dependency observed by the reader.
    pub version: Version,
}

/// Dependencies is an ordered list of pointers to the nodes read by a computation.
///
/// Pointers are grouped: each group was requested in one call and may be
/// re-checked in parallel, while a later group may only have been requested
/// because of values read in an earlier one.
///
/// Clone is cheap as groups are wrapped by `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dependencies(Arc<Vec<Vec<Pointer>>>);

impl Dependencies {
    /// New dependencies from a list of groups. Empty groups are dropped.
    pub fn new(groups: Vec<Vec<Pointer>>) -> Self {
        Dependencies(Arc::new(
            groups.into_iter().filter(|g| !g.is_empty()).collect(),
        ))
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.0.len()
    }

    /// The pointers of one group.
    pub fn group(&self, index: usize) -> &[Pointer] {
        self.0.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if there are no dependencies.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of dependencies.
    pub fn len(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }

    /// Iterate over the dependencies in request order.
    pub fn iter(&self) -> impl Iterator<Item = &Pointer> + '_ {
        self.0.iter().flatten()
    }

    /// Iterate over the dependency keys in request order.
    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> + '_ {
        self.iter().map(|p| &p.key)
    }

    /// Returns true if `key` is one of the dependencies.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.keys().any(|k| k == key)
    }
}

/// What an in-progress node does when a worker picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Bring the dependency groups from `group` on up to date and compare versions.
    CheckDeps { group: usize },
    /// Run the node function.
    Compute,
}

/// Bookkeeping of a node while it is `InProgress`.
#[derive(Debug)]
pub(crate) struct Building {
    /// State to return to if the evaluation stops before the node finishes.
    pub resting: NodeState,
    pub phase: Phase,
    /// Number of completed function runs that ended in a restart.
    pub restarts: u32,
    /// Outstanding dependencies plus a registration sentinel.
    pub pending: usize,
    pub waiting_on: IndexSet<NodeKey, ahash::RandomState>,
    /// The function asked to observe failed dependencies.
    pub tolerant: bool,
    /// Dependencies read by the last run, grouped.
    pub last_reads: Vec<Vec<Pointer>>,
}

impl Building {
    fn new(resting: NodeState, phase: Phase) -> Self {
        Self {
            resting,
            phase,
            restarts: 0,
            pending: 0,
            waiting_on: IndexSet::default(),
            tolerant: false,
            last_reads: Vec::new(),
        }
    }
}

/// Mutable fields of a node entry, guarded by the entry lock.
#[derive(Debug)]
pub(crate) struct EntryData {
    pub state: NodeState,
    pub value: Option<Value>,
    pub error: Option<EvalError>,
    pub deps: Dependencies,
    pub reverse_deps: HashSet<NodeKey, ahash::RandomState>,
    pub version: Version,
    /// The value was injected rather than computed.
    pub injected: bool,
    /// Every key whose reverse deps may contain this node.
    pub rdep_claims: HashSet<NodeKey, ahash::RandomState>,
    /// Nodes waiting for this node to finish.
    pub waiting_parents: Vec<NodeKey>,
    pub building: Option<Building>,
}

impl EntryData {
    fn new() -> Self {
        Self {
            state: NodeState::New,
            value: None,
            error: None,
            deps: Dependencies::default(),
            reverse_deps: HashSet::default(),
            version: Version::default(),
            injected: false,
            rdep_claims: HashSet::default(),
            waiting_parents: Vec::new(),
            building: None,
        }
    }

    /// The finished result, if the node is done.
    pub fn result(&self) -> Option<Result<Value, EvalError>> {
        if self.state != NodeState::Done {
            return None;
        }
        match (&self.error, &self.value) {
            (Some(err), _) => Some(Err(err.clone())),
            (None, Some(value)) => Some(Ok(value.clone())),
            (None, None) => Some(Err(EvalError::internal(
                "done node holds neither a value nor an error",
            ))),
        }
    }

    /// Transition to `InProgress`. Returns true if the caller must enqueue the node.
    pub fn begin(&mut self) -> bool {
        let phase = match self.state {
            NodeState::New | NodeState::ChangedPendingRecompute => Phase::Compute,
            NodeState::Dirty => Phase::CheckDeps { group: 0 },
            NodeState::InProgress | NodeState::Done => return false,
        };
        self.building = Some(Building::new(self.state, phase));
        self.state = NodeState::InProgress;
        true
    }

    /// Return an unfinished node to the state it had before it was scheduled.
    pub fn abandon(&mut self) {
        if let Some(building) = self.building.take() {
            if self.state == NodeState::InProgress {
                self.state = building.resting;
            }
        }
        self.waiting_parents.clear();
    }

    /// Mark as changed. Returns the reverse deps to dirty, or `None` if they
    /// were already dirtied.
    pub fn mark_changed(&mut self) -> Option<Vec<NodeKey>> {
        let was = self.state;
        self.state = NodeState::ChangedPendingRecompute;
        match was {
            NodeState::Dirty | NodeState::ChangedPendingRecompute => None,
            _ => Some(self.reverse_deps.iter().cloned().collect()),
        }
    }

    /// Mark a done node as dirty. Returns the reverse deps to dirty in turn.
    pub fn mark_dirty(&mut self) -> Option<Vec<NodeKey>> {
        if self.state != NodeState::Done {
            return None;
        }
        self.state = NodeState::Dirty;
        Some(self.reverse_deps.iter().cloned().collect())
    }

    pub fn building_mut(&mut self) -> Option<&mut Building> {
        if self.state == NodeState::InProgress {
            self.building.as_mut()
        } else {
            None
        }
    }
}

/// Node is the per-key record managed by the graph.
///
/// All mutable fields sit behind one lock per entry.
#[derive(Debug)]
pub struct NodeEntry {
    key: NodeKey,
    data: Mutex<EntryData>,
}

impl NodeEntry {
    pub(crate) fn new(key: NodeKey) -> Self {
        Self {
            key,
            data: Mutex::new(EntryData::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryData> {
        self.data.lock()
    }

    /// The key of this entry.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.data.lock().state
    }

    /// Returns true if the node is done.
    pub fn is_done(&self) -> bool {
        self.state() == NodeState::Done
    }

    /// Last computed value. Kept while the node is dirty.
    pub fn value(&self) -> Option<Value> {
        self.data.lock().value.clone()
    }

    /// Last computed error.
    pub fn error(&self) -> Option<EvalError> {
        self.data.lock().error.clone()
    }

    /// Version of the current value.
    pub fn version(&self) -> Version {
        self.data.lock().version
    }

    /// Dependencies read by the computation that produced the current value.
    pub fn dependencies(&self) -> Dependencies {
        self.data.lock().deps.clone()
    }

    /// Nodes that depend on this node.
    pub fn reverse_dependencies(&self) -> Vec<NodeKey> {
        self.data.lock().reverse_deps.iter().cloned().collect()
    }

    /// Returns true if the value was injected rather than computed.
    pub fn is_injected(&self) -> bool {
        self.data.lock().injected
    }

    /// Register `reader` as a reverse dependency, then read the result if done.
    ///
    /// The reverse edge is added before the value is read so that a later
    /// invalidation of this node always reaches the reader.
    pub(crate) fn read_for(&self, reader: &NodeKey) -> Option<(Result<Value, EvalError>, Version)> {
        let mut data = self.data.lock();
        data.reverse_deps.insert(reader.clone());
        let version = data.version;
        data.result().map(|result| (result, version))
    }
}
