//! Tracer trait for observing evaluation.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! node execution. The default [`NoopTracer`] provides zero-cost when tracing
//! is not needed, and [`TracingTracer`] forwards every event to the `tracing`
//! crate.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use nodeflow::{Evaluator, NodeKey, SpanId, Tracer};
//!
//! #[derive(Default)]
//! struct PrintTracer(AtomicU64);
//!
//! impl Tracer for PrintTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(self.0.fetch_add(1, Ordering::Relaxed))
//!     }
//!
//!     fn on_node_start(&self, _span_id: SpanId, key: &NodeKey, restart: u32) {
//!         println!("start {key:?} (restart {restart})");
//!     }
//! }
//!
//! let evaluator = Evaluator::builder().tracer(PrintTracer::default()).build();
//! # let _ = evaluator;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::NodeKey;

/// Unique identifier for a node execution span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpanId(pub u64);

/// Classification of how a node run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// The function produced a value different from the previous one.
    Changed,
    /// The function ran but produced a value equal to the previous one.
    Unchanged,
    /// Every dependency was unchanged; the function was not run.
    Pruned,
    /// The function yielded for missing dependencies.
    Restarted,
    /// The node failed.
    Failed {
        /// Display form of the error.
        message: String,
    },
}

/// Why invalidation touched a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The key was passed to [`Evaluator::invalidate`](crate::Evaluator::invalidate).
    Changed,
    /// A transitive dependency was invalidated.
    DependencyDirty,
    /// A new value was injected for the key.
    Injected,
}

/// Tracer trait for observing evaluation.
///
/// All methods have default empty implementations, so you only need to override
/// the events you're interested in. The [`NoopTracer`] uses all defaults for
/// zero-cost when tracing is disabled.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer is called from every
/// worker thread concurrently.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID.
    ///
    /// This is the only required method. Called once per function run.
    fn new_span_id(&self) -> SpanId;

    /// Called when `evaluate` starts.
    #[inline]
    fn on_evaluation_start(&self, _roots: &[NodeKey]) {}

    /// Called when `evaluate` returns.
    #[inline]
    fn on_evaluation_end(&self, _interrupted: bool) {}

    /// Called before a node function runs. `restart` counts earlier runs of
    /// this build of the node that ended in a restart.
    #[inline]
    fn on_node_start(&self, _span_id: SpanId, _key: &NodeKey, _restart: u32) {}

    /// Called when a node run ends.
    #[inline]
    fn on_node_end(&self, _span_id: SpanId, _key: &NodeKey, _outcome: NodeOutcome) {}

    /// Called when a run reads a dependency.
    #[inline]
    fn on_dependency_registered(&self, _span_id: SpanId, _parent: &NodeKey, _dependency: &NodeKey) {}

    /// Called when a dirty node has re-checked its dependencies.
    #[inline]
    fn on_change_pruning_check(&self, _key: &NodeKey, _changed: bool) {}

    /// Called for every node touched by invalidation.
    #[inline]
    fn on_node_invalidated(&self, _key: &NodeKey, _reason: InvalidationReason) {}

    /// Called when a dependency cycle is detected.
    #[inline]
    fn on_cycle_detected(&self, _path: &[NodeKey]) {}
}

/// Zero-cost tracer that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Tracer that forwards events to the `tracing` crate.
#[cfg(feature = "tracing")]
#[derive(Debug, Default)]
pub struct TracingTracer {
    next_span: AtomicU64,
}

#[cfg(feature = "tracing")]
impl TracingTracer {
    /// Create a new tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed))
    }

    fn on_evaluation_start(&self, roots: &[NodeKey]) {
        tracing::debug!(roots = roots.len(), "evaluation started");
    }

    fn on_evaluation_end(&self, interrupted: bool) {
        tracing::debug!(interrupted, "evaluation finished");
    }

    fn on_node_start(&self, span_id: SpanId, key: &NodeKey, restart: u32) {
        tracing::trace!(span = span_id.0, key = ?key, restart, "node started");
    }

    fn on_node_end(&self, span_id: SpanId, key: &NodeKey, outcome: NodeOutcome) {
        match outcome {
            NodeOutcome::Failed { message } => {
                tracing::debug!(span = span_id.0, key = ?key, %message, "node failed")
            }
            outcome => tracing::trace!(span = span_id.0, key = ?key, ?outcome, "node finished"),
        }
    }

    fn on_dependency_registered(&self, span_id: SpanId, parent: &NodeKey, dependency: &NodeKey) {
        tracing::trace!(span = span_id.0, parent = ?parent, dependency = ?dependency, "dependency");
    }

    fn on_change_pruning_check(&self, key: &NodeKey, changed: bool) {
        tracing::trace!(key = ?key, changed, "change pruning check");
    }

    fn on_node_invalidated(&self, key: &NodeKey, reason: InvalidationReason) {
        tracing::trace!(key = ?key, ?reason, "node invalidated");
    }

    fn on_cycle_detected(&self, path: &[NodeKey]) {
        tracing::warn!(path = ?path, "dependency cycle detected");
    }
}
