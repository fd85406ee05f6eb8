//! Error types for evaluation.

use std::fmt;
use std::sync::Arc;

use crate::key::NodeKey;

/// An opaque failure produced by a node function.
///
/// Any `Into<anyhow::Error>` converts into a `DomainError`, so functions can use
/// `?` on their own error types. The engine never interprets the payload.
#[derive(Clone)]
pub struct DomainError(Arc<anyhow::Error>);

impl DomainError {
    /// Create a domain error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl<T: Into<anyhow::Error>> From<T> for DomainError {
    fn from(err: T) -> Self {
        DomainError(Arc::new(err.into()))
    }
}

impl fmt::Debug for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

/// Errors reported for a node by an evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    /// Failure produced by a node function, propagated verbatim.
    #[error("{0}")]
    Domain(DomainError),

    /// Dependency cycle detected.
    ///
    /// The `path` lists the keys forming the cycle in request order.
    #[error("dependency cycle detected: {}", format_path(.path))]
    Cycle {
        /// Keys forming the cycle.
        path: Vec<NodeKey>,
    },

    /// The evaluation was interrupted before this node finished.
    #[error("evaluation interrupted")]
    Interrupted,

    /// An engine invariant was violated. Aborts the whole evaluation.
    #[error("internal inconsistency: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

fn format_path(path: &[NodeKey]) -> String {
    path.iter()
        .map(NodeKey::debug_repr)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl EvalError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        EvalError::Internal {
            message: message.into(),
        }
    }

    /// Returns the domain error if this is a `Domain` variant.
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            EvalError::Domain(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the cycle path if this is a `Cycle` variant.
    pub fn cycle(&self) -> Option<&[NodeKey]> {
        match self {
            EvalError::Cycle { path } => Some(path),
            _ => None,
        }
    }

    /// Returns `true` for a `Cycle` error.
    pub fn is_cycle(&self) -> bool {
        matches!(self, EvalError::Cycle { .. })
    }
}

impl From<DomainError> for EvalError {
    fn from(err: DomainError) -> Self {
        EvalError::Domain(err)
    }
}
