//! Node values.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// A type that can be stored as the value of a node.
///
/// Automatically implemented for every `PartialEq + Debug + Send + Sync + 'static`
/// type. The `PartialEq` implementation is the structural equality used for
/// change pruning, so fields that only cache derived data should be left out
/// of it (implement `PartialEq` by hand for such types).
pub trait NodeValue: Any + Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Structural equality across type-erased values.
    ///
    /// Values of different concrete types are never equal.
    fn value_eq(&self, other: &dyn NodeValue) -> bool;
}

impl<T: PartialEq + Debug + Send + Sync + 'static> NodeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_eq(&self, other: &dyn NodeValue) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Immutable result of evaluating a key.
///
/// Clone is cheap as the value is wrapped by `Arc`.
#[derive(Clone)]
pub struct Value(Arc<dyn NodeValue>);

impl Value {
    /// Wrap a value.
    pub fn new<T: PartialEq + Debug + Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast the value to its concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    /// Structural equality, with a pointer fast path.
    pub fn value_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.value_eq(&*other.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.value_eq(other)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}
