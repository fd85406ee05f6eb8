//! Node functions, the registry mapping kinds to functions, and the
//! per-run environment through which functions request dependencies.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;

use crate::error::{DomainError, EvalError};
use crate::evaluator::Interrupt;
use crate::graph::NodeGraph;
use crate::key::{Kind, NodeKey};
use crate::node::Pointer;
use crate::tracer::{SpanId, Tracer};
use crate::value::Value;

/// Computes the value of keys of one kind.
///
/// A run must be safe to repeat from the top: when it requests a key that is
/// not ready, the request returns [`ComputeError::Restart`], the run should
/// propagate it with `?`, and the function is invoked again once every
/// requested key is done. Values already read are served from the graph on
/// the next run without recomputation.
///
/// Closures of the form `Fn(&NodeKey, &mut Environment<'_>) -> Result<Value, ComputeError>`
/// implement this trait.
pub trait NodeFunction: Send + Sync + 'static {
    /// Compute the value for `key`.
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError>;
}

impl<F> NodeFunction for F
where
    F: Fn(&NodeKey, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
{
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        self(key, env)
    }
}

/// Why a function run did not produce a value.
///
/// Any `Into<anyhow::Error>` converts into [`ComputeError::Domain`], so a
/// function can apply `?` to its own fallible calls. Propagating an
/// [`EvalError`] with `?` wraps it as a domain error; return
/// `ComputeError::Dependency` to forward a dependency failure unchanged.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// A requested key is not ready yet. Propagate it unchanged.
    Restart,
    /// A requested key failed.
    Dependency(EvalError),
    /// The computation itself failed.
    Domain(DomainError),
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::Domain(DomainError::from(err))
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Restart => f.write_str("dependencies missing"),
            ComputeError::Dependency(err) => write!(f, "dependency failed: {err}"),
            ComputeError::Domain(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl ComputeError {
    /// Create a domain error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        ComputeError::Domain(DomainError::msg(message))
    }
}

/// Classification of one function run.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The run produced a value.
    Value(Value),
    /// The run needs the listed keys first.
    Restart(Vec<NodeKey>),
    /// The node failed.
    Error(EvalError),
}

/// Registry of node functions keyed by kind.
///
/// Built once by [`EvaluatorBuilder`](crate::EvaluatorBuilder) and read-only
/// afterwards.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<Kind, Arc<dyn NodeFunction>, ahash::RandomState>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` for `kind`, replacing any earlier registration.
    pub fn register(&mut self, kind: Kind, function: impl NodeFunction) {
        self.functions.insert(kind, Arc::new(function));
    }

    /// The function registered for `kind`.
    pub fn get(&self, kind: Kind) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(&kind)
    }

    /// Returns true if a function is registered for `kind`.
    pub fn contains(&self, kind: Kind) -> bool {
        self.functions.contains_key(&kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

/// What a run left behind, handed back to the scheduler.
pub(crate) struct RunRecord {
    pub outcome: Outcome,
    /// Dependencies read, grouped by request call.
    pub reads: Vec<Vec<Pointer>>,
    /// Every key this node registered itself on as a reverse dependency.
    pub touched: Vec<NodeKey>,
    pub tolerant: bool,
}

/// Per-run context handed to a [`NodeFunction`].
///
/// Exclusively owned by one run and never shared across threads.
pub struct Environment<'a> {
    graph: &'a NodeGraph,
    key: &'a NodeKey,
    tracer: &'a dyn Tracer,
    span: SpanId,
    interrupt: &'a Interrupt,
    restart: u32,
    tolerant: bool,
    reads: Vec<Vec<Pointer>>,
    read_keys: IndexSet<NodeKey, ahash::RandomState>,
    missing: IndexSet<NodeKey, ahash::RandomState>,
    failed: Option<EvalError>,
    self_requested: bool,
}

impl<'a> Environment<'a> {
    pub(crate) fn new(
        graph: &'a NodeGraph,
        key: &'a NodeKey,
        tracer: &'a dyn Tracer,
        span: SpanId,
        interrupt: &'a Interrupt,
        restart: u32,
        tolerant: bool,
    ) -> Self {
        Self {
            graph,
            key,
            tracer,
            span,
            interrupt,
            restart,
            tolerant,
            reads: Vec::new(),
            read_keys: IndexSet::default(),
            missing: IndexSet::default(),
            failed: None,
            self_requested: false,
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &NodeKey {
        self.key
    }

    /// Request the value of `key`.
    ///
    /// Returns the value if `key` is done. Otherwise `key` is scheduled and
    /// [`ComputeError::Restart`] is returned. A failed dependency is returned
    /// as [`ComputeError::Dependency`]; unless this run tolerates dependency
    /// errors the node fails with it whatever the function does next.
    pub fn request(&mut self, key: &NodeKey) -> Result<Value, ComputeError> {
        let mut group = Vec::new();
        let result = self.read(key, &mut group);
        self.push_group(group);
        match result {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(ComputeError::Dependency(err)),
            None => Err(ComputeError::Restart),
        }
    }

    /// Like [`request`](Self::request), but hands a failed dependency back as
    /// the inner `Err` instead of a [`ComputeError`].
    ///
    /// Only meaningful after [`tolerate_dependency_errors`](Self::tolerate_dependency_errors).
    pub fn request_result(&mut self, key: &NodeKey) -> Result<Result<Value, EvalError>, ComputeError> {
        match self.request(key) {
            Ok(value) => Ok(Ok(value)),
            Err(ComputeError::Dependency(err)) if self.failed.is_none() => Ok(Err(err)),
            Err(err) => Err(err),
        }
    }

    /// Request several keys at once.
    ///
    /// Every key that is not ready is scheduled, so they are computed in
    /// parallel, before [`ComputeError::Restart`] is returned.
    pub fn request_all<'k, I>(&mut self, keys: I) -> Result<Vec<Value>, ComputeError>
    where
        I: IntoIterator<Item = &'k NodeKey>,
    {
        let mut group = Vec::new();
        let mut values = Vec::new();
        let mut restart = false;
        let mut first_error = None;
        for key in keys {
            match self.read(key, &mut group) {
                Some(Ok(value)) => values.push(value),
                Some(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                None => restart = true,
            }
        }
        self.push_group(group);
        if restart {
            return Err(ComputeError::Restart);
        }
        match first_error {
            Some(err) => Err(ComputeError::Dependency(err)),
            None => Ok(values),
        }
    }

    /// Opt in to observing failed dependencies.
    ///
    /// Must be called before the first request. The function is then restarted
    /// once its requested keys are done even if some of them failed, and sees
    /// each failure from [`request`](Self::request) or
    /// [`request_result`](Self::request_result). Cycle errors still fail the
    /// node.
    pub fn tolerate_dependency_errors(&mut self) {
        self.tolerant = true;
    }

    /// Returns true if a request in this run hit a key that was not ready.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty() || self.self_requested
    }

    /// Number of earlier runs of this node in the current build that ended in
    /// a restart.
    pub fn restart_round(&self) -> u32 {
        self.restart
    }

    /// Returns true if the evaluation was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    fn read(&mut self, key: &NodeKey, group: &mut Vec<Pointer>) -> Option<Result<Value, EvalError>> {
        if key == self.key {
            self.self_requested = true;
            return None;
        }
        let entry = self.graph.get_or_create(key);
        match entry.read_for(self.key) {
            Some((result, version)) => {
                if self.read_keys.insert(key.clone()) {
                    self.tracer.on_dependency_registered(self.span, self.key, key);
                    group.push(Pointer {
                        key: key.clone(),
                        version,
                    });
                }
                if let Err(err) = &result {
                    if (err.is_cycle() || !self.tolerant) && self.failed.is_none() {
                        self.failed = Some(err.clone());
                    }
                }
                Some(result)
            }
            None => {
                self.missing.insert(key.clone());
                None
            }
        }
    }

    fn push_group(&mut self, group: Vec<Pointer>) {
        if !group.is_empty() {
            self.reads.push(group);
        }
    }

    /// Classify the run and hand its bookkeeping to the scheduler.
    pub(crate) fn finish(self, result: Result<Value, ComputeError>) -> RunRecord {
        let outcome = if self.self_requested {
            Outcome::Error(EvalError::Cycle {
                path: vec![self.key.clone()],
            })
        } else if let Some(err) = self.failed.clone() {
            Outcome::Error(err)
        } else {
            match result {
                Ok(_) if !self.missing.is_empty() => Outcome::Error(EvalError::internal(format!(
                    "{:?} returned a value while dependencies were missing",
                    self.key
                ))),
                Ok(value) => Outcome::Value(value),
                Err(ComputeError::Restart) if self.missing.is_empty() => {
                    Outcome::Error(EvalError::internal(format!(
                        "{:?} requested a restart without missing dependencies",
                        self.key
                    )))
                }
                Err(ComputeError::Restart) => Outcome::Restart(self.missing.iter().cloned().collect()),
                Err(ComputeError::Dependency(_)) if !self.missing.is_empty() => {
                    Outcome::Restart(self.missing.iter().cloned().collect())
                }
                Err(ComputeError::Dependency(err)) => Outcome::Error(err),
                Err(ComputeError::Domain(err)) => Outcome::Error(EvalError::Domain(err)),
            }
        };
        let touched = self
            .read_keys
            .iter()
            .chain(self.missing.iter())
            .cloned()
            .collect();
        RunRecord {
            outcome,
            reads: self.reads,
            touched,
            tolerant: self.tolerant,
        }
    }
}

impl fmt::Debug for Environment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("key", self.key)
            .field("restart", &self.restart)
            .field("tolerant", &self.tolerant)
            .field("missing", &self.missing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeState, Version};
    use crate::tracer::NoopTracer;

    const INPUT: Kind = Kind::new("FN_INPUT");
    const USER: Kind = Kind::new("FN_USER");

    fn done(graph: &NodeGraph, key: &NodeKey, result: Result<Value, EvalError>, version: u64) {
        let entry = graph.get_or_create(key);
        let mut data = entry.lock();
        data.state = NodeState::Done;
        data.version = Version(version);
        match result {
            Ok(value) => data.value = Some(value),
            Err(err) => data.error = Some(err),
        }
    }

    #[test]
    fn test_request_records_grouped_reads() {
        let graph = NodeGraph::new();
        let interrupt = Interrupt::new();
        let user = NodeKey::new(USER, 0_u32);
        let a = NodeKey::new(INPUT, 1_u32);
        let b = NodeKey::new(INPUT, 2_u32);
        let c = NodeKey::new(INPUT, 3_u32);
        done(&graph, &a, Ok(Value::new(1_u32)), 4);
        done(&graph, &b, Ok(Value::new(2_u32)), 5);

        let mut env = Environment::new(&graph, &user, &NoopTracer, SpanId(0), &interrupt, 0, false);
        assert!(env.request(&a).is_ok());
        assert!(env.request(&a).is_ok());
        assert!(matches!(env.request_all([&b, &c]), Err(ComputeError::Restart)));
        assert!(env.values_missing());

        let record = env.finish(Err(ComputeError::Restart));
        assert!(matches!(&record.outcome, Outcome::Restart(keys) if keys == &vec![c.clone()]));
        assert_eq!(record.reads.len(), 2);
        assert_eq!(record.reads[0][0].version, Version(4));
        assert_eq!(record.reads[1][0].key, b);
        assert_eq!(record.touched, vec![a.clone(), b.clone(), c]);
        assert_eq!(graph.get(&a).unwrap().reverse_dependencies(), vec![user]);
    }

    #[test]
    fn test_failed_dependency_fails_intolerant_run() {
        let graph = NodeGraph::new();
        let interrupt = Interrupt::new();
        let user = NodeKey::new(USER, 1_u32);
        let bad = NodeKey::new(INPUT, 10_u32);
        done(&graph, &bad, Err(EvalError::from(DomainError::msg("bad"))), 1);

        let mut env = Environment::new(&graph, &user, &NoopTracer, SpanId(0), &interrupt, 0, false);
        // The function swallows the failure; the run still fails.
        assert!(matches!(env.request(&bad), Err(ComputeError::Dependency(_))));
        let record = env.finish(Ok(Value::new(())));
        assert!(matches!(&record.outcome, Outcome::Error(err) if err.to_string() == "bad"));
    }

    #[test]
    fn test_tolerant_run_sees_failure() {
        let graph = NodeGraph::new();
        let interrupt = Interrupt::new();
        let user = NodeKey::new(USER, 2_u32);
        let bad = NodeKey::new(INPUT, 11_u32);
        done(&graph, &bad, Err(EvalError::from(DomainError::msg("bad"))), 1);

        let mut env = Environment::new(&graph, &user, &NoopTracer, SpanId(0), &interrupt, 0, false);
        env.tolerate_dependency_errors();
        let seen = env.request_result(&bad).unwrap();
        assert_eq!(seen.unwrap_err().to_string(), "bad");
        let record = env.finish(Ok(Value::new("fallback")));
        assert!(matches!(record.outcome, Outcome::Value(_)));
        assert!(record.tolerant);
    }

    #[test]
    fn test_self_request_is_a_cycle() {
        let graph = NodeGraph::new();
        let interrupt = Interrupt::new();
        let user = NodeKey::new(USER, 3_u32);
        let mut env = Environment::new(&graph, &user, &NoopTracer, SpanId(0), &interrupt, 0, false);
        assert!(matches!(env.request(&user), Err(ComputeError::Restart)));
        let record = env.finish(Err(ComputeError::Restart));
        assert!(
            matches!(&record.outcome, Outcome::Error(EvalError::Cycle { path }) if path == &vec![user.clone()])
        );
        assert!(graph.get(&user).is_none());
    }

    #[test]
    fn test_restart_without_missing_is_internal() {
        let graph = NodeGraph::new();
        let interrupt = Interrupt::new();
        let user = NodeKey::new(USER, 4_u32);
        let env = Environment::new(&graph, &user, &NoopTracer, SpanId(0), &interrupt, 0, false);
        let record = env.finish(Err(ComputeError::Restart));
        assert!(matches!(record.outcome, Outcome::Error(EvalError::Internal { .. })));
    }

    #[test]
    fn test_compute_error_from_any_error() {
        fn parse(input: &str) -> Result<Value, ComputeError> {
            let n: i64 = input.parse()?;
            Ok(Value::new(n))
        }
        assert!(parse("12").is_ok());
        assert!(matches!(parse("x"), Err(ComputeError::Domain(_))));
    }
}
