//! One evaluation of a root set: the worker pool, the restart protocol,
//! change pruning of dirty nodes, and cycle detection at quiescence.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::error::EvalError;
use crate::evaluator::{EvaluationResult, Interrupt};
use crate::function::{Environment, FunctionRegistry, Outcome};
use crate::graph::NodeGraph;
use crate::key::NodeKey;
use crate::node::{Dependencies, NodeEntry, NodeState, Phase, Pointer};
use crate::persist::{NodeCache, PersistedNode};
use crate::queue::{Work, WorkQueue};
use crate::tracer::{NodeOutcome, SpanId, Tracer};
use crate::value::Value;

/// What a notification does to a waiting parent.
enum Wake {
    Nothing,
    Enqueue(u32),
    Fail(EvalError, Pointer),
}

/// State of a node after registering on its dependencies.
enum Await {
    /// Every dependency is done; continue synchronously.
    Ready,
    /// The node will be re-enqueued, or it is no longer in progress.
    Pending,
    /// A dependency failed and the node cannot tolerate it.
    Failed(EvalError, Pointer),
}

pub(crate) struct Evaluation<'a, T: Tracer> {
    graph: &'a NodeGraph,
    registry: &'a FunctionRegistry,
    tracer: &'a T,
    cache: &'a dyn NodeCache,
    queue: WorkQueue,
    roots: IndexSet<NodeKey, ahash::RandomState>,
    keep_going: bool,
    interrupt: &'a Interrupt,
    /// Set when dispatching must stop: a fatal error, or a failed root
    /// without keep-going.
    stopped: AtomicBool,
    fatal: Mutex<Option<EvalError>>,
    /// Every node this evaluation moved to `InProgress`.
    in_flight: Mutex<Vec<NodeKey>>,
}

impl<'a, T: Tracer> Evaluation<'a, T> {
    pub fn new(
        graph: &'a NodeGraph,
        registry: &'a FunctionRegistry,
        tracer: &'a T,
        cache: &'a dyn NodeCache,
        roots: IndexSet<NodeKey, ahash::RandomState>,
        keep_going: bool,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            graph,
            registry,
            tracer,
            cache,
            queue: WorkQueue::new(),
            roots,
            keep_going,
            interrupt,
            stopped: AtomicBool::new(false),
            fatal: Mutex::new(None),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn run(self, workers: usize) -> Result<EvaluationResult, EvalError> {
        if !self.interrupt.is_interrupted() {
            for root in &self.roots {
                let entry = self.graph.get_or_create(root);
                self.schedule(&entry);
            }
        }

        if !self.queue.is_empty() {
            thread::scope(|s| {
                for _ in 0..workers.max(1) {
                    s.spawn(|| self.work_loop());
                }
                self.coordinate();
                self.queue.shutdown();
            });
        }

        self.reset_unfinished();
        if let Some(err) = self.fatal.lock().take() {
            return Err(err);
        }

        let mut results = IndexMap::with_capacity(self.roots.len());
        let mut unfinished = false;
        for root in &self.roots {
            let result = self
                .graph
                .get(root)
                .and_then(|entry| entry.lock().result())
                .unwrap_or_else(|| {
                    unfinished = true;
                    Err(EvalError::Interrupted)
                });
            results.insert(root.clone(), result);
        }
        let interrupted = unfinished || self.interrupt.is_interrupted();
        Ok(EvaluationResult::new(results, interrupted))
    }

    fn should_stop(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.interrupt.is_interrupted()
    }

    fn fail_fatal(&self, err: EvalError) {
        tracing_fatal(&err);
        self.fatal.lock().get_or_insert(err);
        self.stopped.store(true, Ordering::Release);
    }

    fn work_loop(&self) {
        while let Some(claim) = self.queue.pop() {
            if self.should_stop() {
                continue;
            }
            self.process(&claim);
        }
    }

    /// Wait for quiescence, then either finish or break a cycle that keeps
    /// nodes from completing.
    ///
    /// Unfinished roots are searched first. Once every root is done, nodes
    /// still in progress can only be stuck in a cycle of their own, which is
    /// reported too.
    fn coordinate(&self) {
        loop {
            self.queue.wait_idle();
            if self.should_stop() {
                return;
            }
            let stuck = self.stuck_nodes();
            if stuck.is_empty() {
                return;
            }
            let starts: Vec<&NodeKey> = stuck.iter().collect();
            if !self.break_cycle(&starts) {
                self.fail_fatal(EvalError::internal(format!(
                    "evaluation stalled with {} unfinished nodes and no cycle",
                    stuck.len()
                )));
                return;
            }
        }
    }

    /// Unfinished roots, or if there are none, every node left in progress.
    fn stuck_nodes(&self) -> Vec<NodeKey> {
        let roots: Vec<NodeKey> = self
            .roots
            .iter()
            .filter(|root| self.graph.get(root).is_some_and(|entry| !entry.is_done()))
            .cloned()
            .collect();
        if !roots.is_empty() {
            return roots;
        }
        let in_flight = self.in_flight.lock().clone();
        in_flight
            .into_iter()
            .filter(|key| {
                self.graph
                    .get(key)
                    .is_some_and(|entry| entry.state() == NodeState::InProgress)
            })
            .collect()
    }

    /// The entry for `key`, failing the evaluation if the graph lost it.
    fn entry(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        let entry = self.graph.get(key);
        if entry.is_none() {
            self.fail_fatal(EvalError::internal(format!(
                "{key:?} is referenced by an edge but missing from the graph"
            )));
        }
        entry
    }

    /// Move `entry` to `InProgress` and enqueue it if it is not done or
    /// already in progress. Returns true if the node is done.
    fn schedule(&self, entry: &NodeEntry) -> bool {
        let mut data = entry.lock();
        if data.state == NodeState::Done {
            return true;
        }
        if data.state == NodeState::New {
            if let Some(persisted) = self.cache.load(entry.key()) {
                self.graph.observe_version(persisted.version);
                for pointer in persisted.deps.iter() {
                    self.graph.observe_version(pointer.version);
                }
                data.rdep_claims = persisted.deps.keys().cloned().collect();
                data.value = Some(persisted.value);
                data.version = persisted.version;
                data.deps = persisted.deps;
                data.state = NodeState::Dirty;
            }
        }
        if data.begin() {
            drop(data);
            self.in_flight.lock().push(entry.key().clone());
            self.queue.push(Work {
                key: entry.key().clone(),
                restart: 0,
            });
        }
        false
    }

    fn process(&self, work: &Work) {
        let Some(entry) = self.entry(&work.key) else {
            return;
        };
        let phase = {
            let mut data = entry.lock();
            match data.building_mut() {
                Some(building) if building.restarts == work.restart => building.phase,
                _ => return,
            }
        };
        match phase {
            Phase::CheckDeps { group } => self.check_deps(&entry, group),
            Phase::Compute => self.compute(&entry),
        }
    }

    /// Bring the recorded dependencies of a dirty node up to date, group by
    /// group, and finish it without running its function if none changed.
    fn check_deps(&self, entry: &NodeEntry, start: usize) {
        let deps = entry.lock().deps.clone();
        for group in start..deps.group_count() {
            let pointers = deps.group(group);
            let keys: Vec<NodeKey> = pointers.iter().map(|p| p.key.clone()).collect();
            match self.await_deps(entry, &keys, Phase::CheckDeps { group }) {
                Await::Ready => {}
                Await::Pending => return,
                Await::Failed(err, dep) => {
                    let parents = self.fail_with_dependency(entry, err, dep);
                    self.wake_parents(entry.key(), parents);
                    return;
                }
            }
            let changed = pointers.iter().any(|pointer| {
                let dep = self.graph.get_or_create(&pointer.key);
                dep.read_for(entry.key())
                    .map_or(true, |(_, version)| version != pointer.version)
            });
            if changed {
                self.tracer.on_change_pruning_check(entry.key(), true);
                {
                    let mut data = entry.lock();
                    match data.building_mut() {
                        Some(building) => building.phase = Phase::Compute,
                        None => return,
                    }
                }
                self.compute(entry);
                return;
            }
        }
        self.tracer.on_change_pruning_check(entry.key(), false);
        let parents = {
            let mut data = entry.lock();
            if data.building_mut().is_none() {
                return;
            }
            data.building = None;
            data.state = NodeState::Done;
            std::mem::take(&mut data.waiting_parents)
        };
        let span = self.tracer.new_span_id();
        self.tracer.on_node_end(span, entry.key(), NodeOutcome::Pruned);
        self.wake_parents(entry.key(), parents);
    }

    /// Register `entry` as waiting on every key of `keys` that is not done,
    /// scheduling those. If all of them are already done the caller continues
    /// synchronously; otherwise the last finishing dependency re-enqueues the
    /// node.
    fn await_deps(&self, entry: &NodeEntry, keys: &[NodeKey], phase: Phase) -> Await {
        {
            let mut data = entry.lock();
            let Some(building) = data.building_mut() else {
                return Await::Pending;
            };
            building.phase = phase;
            // The sentinel keeps notifications from enqueueing the node
            // before every dependency is registered.
            building.pending = 1;
            building.waiting_on = keys.iter().cloned().collect();
        }
        let mut seen: HashSet<&NodeKey, ahash::RandomState> = HashSet::default();
        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            {
                let mut data = entry.lock();
                match data.building_mut() {
                    Some(building) => building.pending += 1,
                    None => return Await::Pending,
                }
            }
            let dep = self.graph.get_or_create(key);
            self.schedule(&dep);
            let finished = {
                let mut data = dep.lock();
                if data.state == NodeState::Done {
                    Some((data.error.clone(), data.version))
                } else {
                    data.waiting_parents.push(entry.key().clone());
                    None
                }
            };
            let Some((error, version)) = finished else {
                continue;
            };
            let mut data = entry.lock();
            let Some(building) = data.building_mut() else {
                return Await::Pending;
            };
            match error {
                Some(err) if phase == Phase::Compute && (err.is_cycle() || !building.tolerant) => {
                    building.waiting_on.clear();
                    return Await::Failed(
                        err,
                        Pointer {
                            key: key.clone(),
                            version,
                        },
                    );
                }
                _ => {
                    building.waiting_on.swap_remove(key);
                    building.pending -= 1;
                }
            }
        }
        let mut data = entry.lock();
        match data.building_mut() {
            Some(building) => {
                building.pending -= 1;
                if building.pending == 0 {
                    Await::Ready
                } else {
                    Await::Pending
                }
            }
            None => Await::Pending,
        }
    }

    /// Fail `entry` with the error of a dependency it was waiting on.
    fn fail_with_dependency(&self, entry: &NodeEntry, err: EvalError, dep: Pointer) -> Vec<NodeKey> {
        let reads = {
            let mut data = entry.lock();
            match data.building_mut() {
                Some(building) => {
                    let mut reads = building.last_reads.clone();
                    reads.push(vec![dep]);
                    reads
                }
                None => return Vec::new(),
            }
        };
        self.finalize(entry, Err(err), reads, None)
    }

    /// Run the node function until it produces a value, fails, or has to
    /// wait for dependencies that are not done.
    fn compute(&self, entry: &NodeEntry) {
        let key = entry.key();
        let Some(function) = self.registry.get(key.kind()) else {
            self.fail_fatal(EvalError::internal(format!(
                "no function registered for kind {}",
                key.kind()
            )));
            return;
        };
        loop {
            if self.should_stop() {
                return;
            }
            let (restart, tolerant) = {
                let mut data = entry.lock();
                match data.building_mut() {
                    Some(building) => (building.restarts, building.tolerant),
                    None => return,
                }
            };
            let span = self.tracer.new_span_id();
            self.tracer.on_node_start(span, key, restart);
            let mut env = Environment::new(
                self.graph,
                key,
                self.tracer,
                span,
                self.interrupt,
                restart,
                tolerant,
            );
            let result = match panic::catch_unwind(AssertUnwindSafe(|| function.compute(key, &mut env))) {
                Ok(result) => result,
                Err(_) => {
                    self.fail_fatal(EvalError::internal(format!("node function for {key:?} panicked")));
                    return;
                }
            };
            let record = env.finish(result);
            {
                let mut data = entry.lock();
                data.rdep_claims.extend(record.touched);
                match data.building_mut() {
                    Some(building) => {
                        building.tolerant = record.tolerant;
                        building.last_reads = record.reads.clone();
                    }
                    None => return,
                }
            }
            match record.outcome {
                Outcome::Value(value) => {
                    self.settle(entry, Ok(value), record.reads, Some(span));
                    return;
                }
                Outcome::Error(err) => {
                    if let EvalError::Cycle { path } = &err {
                        self.tracer.on_cycle_detected(path);
                    }
                    if matches!(err, EvalError::Internal { .. }) {
                        self.fail_fatal(err);
                        return;
                    }
                    self.settle(entry, Err(err), record.reads, Some(span));
                    return;
                }
                Outcome::Restart(missing) => {
                    self.tracer.on_node_end(span, key, NodeOutcome::Restarted);
                    {
                        let mut data = entry.lock();
                        match data.building_mut() {
                            Some(building) => building.restarts += 1,
                            None => return,
                        }
                    }
                    match self.await_deps(entry, &missing, Phase::Compute) {
                        Await::Ready => {}
                        Await::Pending => return,
                        Await::Failed(err, dep) => {
                            let parents = self.fail_with_dependency(entry, err, dep);
                            self.wake_parents(entry.key(), parents);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Finish a node and wake every node waiting on it, transitively for
    /// parents that fail as a consequence.
    fn settle(
        &self,
        entry: &NodeEntry,
        result: Result<Value, EvalError>,
        reads: Vec<Vec<Pointer>>,
        span: Option<SpanId>,
    ) {
        let parents = self.finalize(entry, result, reads, span);
        self.wake_parents(entry.key(), parents);
    }

    fn finalize(
        &self,
        entry: &NodeEntry,
        result: Result<Value, EvalError>,
        reads: Vec<Vec<Pointer>>,
        span: Option<SpanId>,
    ) -> Vec<NodeKey> {
        let deps = Dependencies::new(reads);
        let (parents, obsolete, outcome, stored) = {
            let mut data = entry.lock();
            if data.building_mut().is_none() {
                return Vec::new();
            }
            let changed = match (&result, &data.value, &data.error) {
                (Ok(new), Some(old), None) => !new.value_eq(old),
                _ => true,
            };
            if changed {
                data.version = self.graph.next_version();
            }
            let outcome = match &result {
                Err(err) => NodeOutcome::Failed {
                    message: err.to_string(),
                },
                Ok(_) if changed => NodeOutcome::Changed,
                Ok(_) => NodeOutcome::Unchanged,
            };
            let stored = match result {
                Ok(value) => {
                    data.value = Some(value.clone());
                    data.error = None;
                    Some(PersistedNode {
                        value,
                        deps: deps.clone(),
                        version: data.version,
                    })
                }
                Err(err) => {
                    data.value = None;
                    data.error = Some(err);
                    None
                }
            };
            let current: HashSet<NodeKey, ahash::RandomState> = deps.keys().cloned().collect();
            let obsolete: Vec<NodeKey> = data
                .rdep_claims
                .iter()
                .filter(|key| !current.contains(*key))
                .cloned()
                .collect();
            data.rdep_claims = current;
            data.deps = deps;
            data.injected = false;
            data.building = None;
            data.state = NodeState::Done;
            (std::mem::take(&mut data.waiting_parents), obsolete, outcome, stored)
        };

        for key in obsolete {
            if let Some(dep) = self.entry(&key) {
                dep.lock().reverse_deps.remove(entry.key());
            }
        }
        let failed = matches!(outcome, NodeOutcome::Failed { .. });
        let span = span.unwrap_or_else(|| self.tracer.new_span_id());
        self.tracer.on_node_end(span, entry.key(), outcome);
        if let Some(stored) = stored {
            self.cache.store(entry.key(), &stored);
        }
        if failed && !self.keep_going && self.roots.contains(entry.key()) {
            self.stopped.store(true, Ordering::Release);
        }
        parents
    }

    fn wake_parents(&self, child: &NodeKey, parents: Vec<NodeKey>) {
        let mut worklist: Vec<(NodeKey, NodeKey)> =
            parents.into_iter().map(|parent| (child.clone(), parent)).collect();
        while let Some((child, parent)) = worklist.pop() {
            let Some(child_entry) = self.entry(&child) else {
                return;
            };
            let (child_error, child_version) = {
                let data = child_entry.lock();
                (data.error.clone(), data.version)
            };
            let Some(parent_entry) = self.entry(&parent) else {
                return;
            };
            let wake = {
                let mut data = parent_entry.lock();
                match data.building_mut() {
                    Some(building) if !building.waiting_on.contains(&child) => Wake::Nothing,
                    Some(building) => {
                        building.waiting_on.swap_remove(&child);
                        match child_error {
                            Some(err)
                                if building.phase == Phase::Compute
                                    && (err.is_cycle() || !building.tolerant) =>
                            {
                                Wake::Fail(
                                    err,
                                    Pointer {
                                        key: child.clone(),
                                        version: child_version,
                                    },
                                )
                            }
                            _ => {
                                building.pending -= 1;
                                if building.pending == 0 {
                                    Wake::Enqueue(building.restarts)
                                } else {
                                    Wake::Nothing
                                }
                            }
                        }
                    }
                    _ => Wake::Nothing,
                }
            };
            match wake {
                Wake::Nothing => {}
                Wake::Enqueue(restart) => self.queue.push(Work {
                    key: parent,
                    restart,
                }),
                Wake::Fail(err, dep) => {
                    let grandparents = self.fail_with_dependency(&parent_entry, err, dep);
                    worklist.extend(grandparents.into_iter().map(|gp| (parent.clone(), gp)));
                }
            }
        }
    }

    /// Find a cycle among the nodes reachable from `starts` over waiting
    /// edges and fail every node in it. Returns false if there is none.
    ///
    /// A member records the other members it waited on, plus waited keys that
    /// are already done. Waited keys outside the cycle that are still in
    /// progress are not recorded; they keep running and are searched again at
    /// the next quiescence.
    fn break_cycle(&self, starts: &[&NodeKey]) -> bool {
        let Some(path) = self.find_cycle(starts) else {
            return false;
        };
        self.tracer.on_cycle_detected(&path);
        let err = EvalError::Cycle { path: path.clone() };
        let members: HashSet<&NodeKey, ahash::RandomState> = path.iter().collect();
        let mut wakes = Vec::new();
        for key in &path {
            let Some(entry) = self.entry(key) else {
                return true;
            };
            let (mut reads, waited) = {
                let mut data = entry.lock();
                match data.building_mut() {
                    Some(building) => {
                        let waited: Vec<NodeKey> = building.waiting_on.drain(..).collect();
                        (building.last_reads.clone(), waited)
                    }
                    None => continue,
                }
            };
            let mut group = Vec::new();
            for dep in waited {
                if &dep == key {
                    continue;
                }
                if members.contains(&dep) {
                    // Members all fail in this loop. The default version
                    // forces a recompute when the member is re-checked.
                    group.push(Pointer {
                        key: dep,
                        version: Default::default(),
                    });
                } else if let Some(version) = self.entry(&dep).and_then(|d| {
                    let data = d.lock();
                    (data.state == NodeState::Done).then_some(data.version)
                }) {
                    group.push(Pointer { key: dep, version });
                }
            }
            reads.push(group);
            let parents = self.finalize(&entry, Err(err.clone()), reads, None);
            wakes.push((key.clone(), parents));
        }
        for (key, parents) in wakes {
            self.wake_parents(&key, parents);
        }
        true
    }

    /// Depth-first search along `waiting_on` edges.
    fn find_cycle(&self, starts: &[&NodeKey]) -> Option<Vec<NodeKey>> {
        let mut visited: HashSet<NodeKey, ahash::RandomState> = HashSet::default();
        for start in starts {
            if visited.contains(*start) {
                continue;
            }
            let mut path: Vec<NodeKey> = Vec::new();
            let mut on_path: IndexMap<NodeKey, usize, ahash::RandomState> = IndexMap::default();
            let mut stack: Vec<Vec<NodeKey>> = Vec::new();
            visited.insert((*start).clone());
            on_path.insert((*start).clone(), 0);
            path.push((*start).clone());
            stack.push(self.waiting_on(start));
            while let Some(children) = stack.last_mut() {
                let Some(child) = children.pop() else {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        on_path.swap_remove(&done);
                    }
                    continue;
                };
                if let Some(&index) = on_path.get(&child) {
                    return Some(path[index..].to_vec());
                }
                if visited.insert(child.clone()) {
                    on_path.insert(child.clone(), path.len());
                    stack.push(self.waiting_on(&child));
                    path.push(child);
                }
            }
        }
        None
    }

    /// Keys `key` waits on, in reverse so that popping yields request order.
    fn waiting_on(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.graph
            .get(key)
            .and_then(|entry| {
                let mut data = entry.lock();
                data.building_mut()
                    .map(|building| building.waiting_on.iter().rev().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Return nodes left unfinished by an early stop to their resting state.
    fn reset_unfinished(&self) {
        for key in self.in_flight.lock().drain(..) {
            if let Some(entry) = self.graph.get(&key) {
                let mut data = entry.lock();
                if data.state == NodeState::InProgress {
                    data.abandon();
                } else {
                    data.waiting_parents.clear();
                }
            }
        }
    }
}

#[cfg(feature = "tracing")]
fn tracing_fatal(err: &EvalError) {
    tracing::error!(error = %err, "evaluation aborted");
}

#[cfg(not(feature = "tracing"))]
fn tracing_fatal(_err: &EvalError) {}
