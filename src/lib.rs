#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod error;
mod evaluator;
mod function;
mod graph;
mod invalidation;
mod key;
mod node;
mod persist;
mod queue;
mod scheduler;
pub mod tracer;
mod value;

pub use error::{DomainError, EvalError};
pub use evaluator::{EvaluationOptions, EvaluationResult, Evaluator, EvaluatorBuilder, Interrupt};
pub use function::{ComputeError, Environment, FunctionRegistry, NodeFunction, Outcome};
pub use graph::NodeGraph;
pub use key::{DynEq, KeyArgs, KeyInterner, Kind, NodeKey};
pub use node::{Dependencies, NodeEntry, NodeState, Pointer, Version};
pub use persist::{InMemoryCache, NodeCache, NoopCache, PersistedNode};
#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
pub use tracer::{InvalidationReason, NodeOutcome, NoopTracer, SpanId, Tracer};
pub use value::{NodeValue, Value};
