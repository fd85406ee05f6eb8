//! The evaluator: the client-facing entry point for evaluation, invalidation,
//! and injection of input values.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::error::EvalError;
use crate::function::{ComputeError, Environment, FunctionRegistry, NodeFunction};
use crate::graph::NodeGraph;
use crate::invalidation::Invalidator;
use crate::key::{Kind, NodeKey};
use crate::persist::{NodeCache, NoopCache};
use crate::scheduler::Evaluation;
use crate::tracer::{NoopTracer, Tracer};
use crate::value::Value;

/// Shared cancellation flag.
///
/// Clones share the flag, so a handle kept by another thread can stop a
/// running evaluation. Completed nodes stay cached; unfinished roots report
/// [`EvalError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create a handle that is not interrupted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-call options of [`Evaluator::evaluate`].
///
/// # Example
///
/// ```
/// use nodeflow::{EvaluationOptions, Interrupt};
///
/// let interrupt = Interrupt::new();
/// let options = EvaluationOptions::new()
///     .keep_going(false)
///     .with_interrupt(interrupt.clone());
/// assert!(!options.is_keep_going());
/// ```
#[derive(Debug, Clone)]
pub struct EvaluationOptions {
    keep_going: bool,
    interrupt: Interrupt,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationOptions {
    /// Keep going on errors, no interrupt handle.
    pub fn new() -> Self {
        Self {
            keep_going: true,
            interrupt: Interrupt::new(),
        }
    }

    /// Whether evaluation continues after a root fails (default: true).
    ///
    /// With `false`, no new work is dispatched once any root has failed and
    /// roots that did not finish report [`EvalError::Interrupted`].
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Use `interrupt` as the cancellation flag.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Returns the keep-going setting.
    pub fn is_keep_going(&self) -> bool {
        self.keep_going
    }

    /// The cancellation flag.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }
}

/// Per-root results of one evaluation, in root order.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    results: IndexMap<NodeKey, Result<Value, EvalError>>,
    interrupted: bool,
}

impl EvaluationResult {
    pub(crate) fn new(results: IndexMap<NodeKey, Result<Value, EvalError>>, interrupted: bool) -> Self {
        Self {
            results,
            interrupted,
        }
    }

    /// The result for `key`, if it was a root.
    pub fn get(&self, key: &NodeKey) -> Option<&Result<Value, EvalError>> {
        self.results.get(key)
    }

    /// The value for `key`, if it was a root and succeeded.
    pub fn value(&self, key: &NodeKey) -> Option<&Value> {
        self.get(key).and_then(|result| result.as_ref().ok())
    }

    /// The error for `key`, if it was a root and failed.
    pub fn error(&self, key: &NodeKey) -> Option<&EvalError> {
        self.get(key).and_then(|result| result.as_ref().err())
    }

    /// Returns true if any root failed.
    pub fn has_errors(&self) -> bool {
        self.results.values().any(Result::is_err)
    }

    /// Returns true if the evaluation stopped before every root finished.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Iterate over the roots and their results.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeKey, &Result<Value, EvalError>)> + '_ {
        self.results.iter()
    }

    /// Number of roots.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if there were no roots.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Builder for [`Evaluator`].
pub struct EvaluatorBuilder<T: Tracer = NoopTracer> {
    registry: FunctionRegistry,
    tracer: T,
    cache: Option<Arc<dyn NodeCache>>,
    workers: usize,
}

impl Default for EvaluatorBuilder<NoopTracer> {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluatorBuilder<NoopTracer> {
    /// Create a builder with no functions, the no-op tracer, and one worker
    /// per available CPU.
    pub fn new() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            tracer: NoopTracer,
            cache: None,
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }
}

impl<T: Tracer> EvaluatorBuilder<T> {
    /// Number of worker threads per evaluation. Values below one are raised to one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the tracer.
    pub fn tracer<U: Tracer>(self, tracer: U) -> EvaluatorBuilder<U> {
        EvaluatorBuilder {
            registry: self.registry,
            tracer,
            cache: self.cache,
            workers: self.workers,
        }
    }

    /// Attach a persistent cache. New nodes are looked up in it and every
    /// newly computed value is stored.
    pub fn cache(mut self, cache: Arc<dyn NodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register `function` for `kind`.
    pub fn register(mut self, kind: Kind, function: impl NodeFunction) -> Self {
        self.registry.register(kind, function);
        self
    }

    /// Register a closure for `kind`.
    ///
    /// Same as [`register`](Self::register), with a signature that lets the
    /// compiler infer the closure's argument and return types.
    pub fn register_fn<F>(self, kind: Kind, function: F) -> Self
    where
        F: Fn(&NodeKey, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
    {
        self.register(kind, function)
    }

    /// Build the evaluator.
    pub fn build(self) -> Evaluator<T> {
        let graph = NodeGraph::new();
        if let Some(cache) = &self.cache {
            graph.observe_version(cache.latest_version());
        }
        Evaluator {
            graph,
            registry: self.registry,
            tracer: self.tracer,
            cache: self.cache.unwrap_or_else(|| Arc::new(NoopCache)),
            workers: self.workers,
            exclusive: Mutex::new(()),
        }
    }
}

/// Owns the node graph and the function registry, and runs evaluations.
///
/// `evaluate`, `invalidate`, and `inject` are serialized: invalidation never
/// runs while an evaluation is in progress.
pub struct Evaluator<T: Tracer = NoopTracer> {
    graph: NodeGraph,
    registry: FunctionRegistry,
    tracer: T,
    cache: Arc<dyn NodeCache>,
    workers: usize,
    exclusive: Mutex<()>,
}

impl Evaluator<NoopTracer> {
    /// Create a builder.
    pub fn builder() -> EvaluatorBuilder<NoopTracer> {
        EvaluatorBuilder::new()
    }
}

impl<T: Tracer> Evaluator<T> {
    /// Evaluate `roots` and return the value or error of each.
    ///
    /// Nodes that are already done are served from the graph. Dirty nodes
    /// re-check their dependencies first and only recompute if one of them
    /// changed.
    ///
    /// Returns `Err` only for an internal inconsistency, which aborts the
    /// whole evaluation.
    pub fn evaluate<I>(&self, roots: I, options: &EvaluationOptions) -> Result<EvaluationResult, EvalError>
    where
        I: IntoIterator<Item = NodeKey>,
    {
        let _guard = self.exclusive.lock();
        let roots: IndexSet<NodeKey, ahash::RandomState> = roots.into_iter().collect();
        let root_list: Vec<NodeKey> = roots.iter().cloned().collect();
        self.tracer.on_evaluation_start(&root_list);

        let evaluation = Evaluation::new(
            &self.graph,
            &self.registry,
            &self.tracer,
            &*self.cache,
            roots,
            options.keep_going,
            &options.interrupt,
        );
        let result = evaluation.run(self.workers);

        let interrupted = result.as_ref().map_or(true, EvaluationResult::interrupted);
        self.tracer.on_evaluation_end(interrupted);
        result
    }

    /// Evaluate a single key with default options.
    pub fn evaluate_one(&self, key: &NodeKey) -> Result<Value, EvalError> {
        let result = self.evaluate([key.clone()], &EvaluationOptions::new())?;
        match result.get(key) {
            Some(result) => result.clone(),
            None => Err(EvalError::internal(format!("no result for root {key:?}"))),
        }
    }

    /// Mark `changed` as changed and every node that can observe them as dirty.
    ///
    /// Keys unknown to the graph are created in the changed state.
    pub fn invalidate<I>(&self, changed: I)
    where
        I: IntoIterator<Item = NodeKey>,
    {
        let _guard = self.exclusive.lock();
        Invalidator::new(&self.graph, &self.tracer).invalidate(changed);
    }

    /// Set `key` to `value` without running a function, as for an input node
    /// fed by an external change-detection layer.
    ///
    /// Dependents are dirtied only if the value differs from the previous one.
    pub fn inject(&self, key: NodeKey, value: Value) {
        let _guard = self.exclusive.lock();
        Invalidator::new(&self.graph, &self.tracer).inject(&key, value, &*self.cache);
    }

    /// Mark every node that failed with a domain error as changed, so the next
    /// evaluation retries it. Returns the affected keys.
    pub fn invalidate_errors(&self) -> Vec<NodeKey> {
        let _guard = self.exclusive.lock();
        Invalidator::new(&self.graph, &self.tracer).invalidate_errors()
    }

    /// The node graph.
    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    /// The tracer.
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    /// Number of worker threads per evaluation.
    pub fn workers(&self) -> usize {
        self.workers
    }
}
