//! Node keys and the process-wide key interner.
//!
//! A [`NodeKey`] is a function [`Kind`] plus a type-erased argument tuple. Every
//! key handed out by [`NodeKey::new`] is canonical: structurally equal keys
//! resolve to the same shared instance, so identity comparison is a valid
//! equality fast path.

use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, OnceLock};

use dyn_hash::DynHash;
use papaya::HashMap;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Arguments of a node key.
///
/// Automatically implemented for every `Hash + Eq + Debug + Send + Sync + 'static`
/// type, so a `String`, a tuple such as `(String, bool)`, or a small struct
/// deriving those traits can be used directly.
pub trait KeyArgs: DynHash + DynEq + Debug + Send + Sync {
    /// Get the arguments as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyArgs for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(KeyArgs);

/// The function-kind tag of a key, e.g. `Kind::new("REPOSITORY_MAPPING")`.
///
/// The kind selects the registered [`NodeFunction`](crate::NodeFunction) that
/// computes values for keys of this kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(&'static str);

impl Kind {
    /// Create a kind from its name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The name of this kind.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

struct KeyInner {
    kind: Kind,
    args: Box<dyn KeyArgs>,
    hash: u64,
}

impl KeyInner {
    fn args(&self) -> &dyn KeyArgs {
        &*self.args
    }
}

fn key_hasher() -> &'static ahash::RandomState {
    static HASHER: OnceLock<ahash::RandomState> = OnceLock::new();
    HASHER.get_or_init(|| {
        ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
    })
}

/// Canonical identifier of a computable node.
///
/// Cheap to clone (a single `Arc`). Equality is structural over
/// (kind, arguments) with a pointer fast path; the hash is computed once at
/// construction.
#[derive(Clone)]
pub struct NodeKey(Arc<KeyInner>);

impl NodeKey {
    /// Create (or look up) the canonical key for `kind` and `args`.
    ///
    /// Interns through [`KeyInterner::global`].
    pub fn new<A>(kind: Kind, args: A) -> Self
    where
        A: Hash + Eq + Debug + Send + Sync + 'static,
    {
        KeyInterner::global().intern(Self::detached(kind, args))
    }

    /// Build a key without interning it.
    pub(crate) fn detached<A>(kind: Kind, args: A) -> Self
    where
        A: Hash + Eq + Debug + Send + Sync + 'static,
    {
        let args: Box<dyn KeyArgs> = Box::new(args);
        let mut hasher = key_hasher().build_hasher();
        kind.hash(&mut hasher);
        args.as_any().type_id().hash(&mut hasher);
        args.hash(&mut hasher);
        let hash = hasher.finish();
        Self(Arc::new(KeyInner { kind, args, hash }))
    }

    /// The function kind of this key.
    pub fn kind(&self) -> Kind {
        self.0.kind
    }

    /// Downcast the arguments to their concrete type.
    pub fn args<A: 'static>(&self) -> Option<&A> {
        self.0.args().as_any().downcast_ref()
    }

    /// Returns `true` if both handles point at the same interned instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Debug representation of this key, e.g. `REPO("x")`.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.0.kind, self.0.args())
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.0.hash == other.0.hash
            && self.0.kind == other.0.kind
            && self.0.args().dyn_eq(other.0.args().as_any())
    }
}

impl Eq for NodeKey {}

/// Concurrent, append-only table of canonical keys.
///
/// Uses papaya's lock-free HashMap internally; `get_or_insert` gives exactly
/// one winner when equal candidates race. Entries are never removed.
pub struct KeyInterner {
    keys: HashMap<NodeKey, NodeKey, ahash::RandomState>,
}

impl Default for KeyInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyInterner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self {
            keys: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// The process-wide interner used by [`NodeKey::new`].
    pub fn global() -> &'static KeyInterner {
        static GLOBAL: OnceLock<KeyInterner> = OnceLock::new();
        GLOBAL.get_or_init(KeyInterner::new)
    }

    /// Return the canonical instance equal to `candidate`.
    ///
    /// If an equal key is already registered the candidate is discarded,
    /// otherwise the candidate becomes canonical.
    pub fn intern(&self, candidate: NodeKey) -> NodeKey {
        let pinned = self.keys.pin();
        if let Some(existing) = pinned.get(&candidate) {
            return existing.clone();
        }
        pinned.get_or_insert(candidate.clone(), candidate).clone()
    }

    /// Number of canonical keys.
    pub fn len(&self) -> usize {
        self.keys.pin().len()
    }

    /// Returns `true` if no key has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: Kind = Kind::new("REPO");
    const PACKAGE: Kind = Kind::new("PACKAGE");

    #[test]
    fn test_intern_returns_first_candidate() {
        let interner = KeyInterner::new();
        let first = NodeKey::detached(REPO, ("x".to_string(), true));
        let second = NodeKey::detached(REPO, ("x".to_string(), true));
        assert!(!first.ptr_eq(&second));

        let canonical = interner.intern(first.clone());
        assert!(canonical.ptr_eq(&first));
        let again = interner.intern(second);
        assert!(again.ptr_eq(&first));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_structural_equality() {
        let a = NodeKey::detached(REPO, "x".to_string());
        let b = NodeKey::detached(REPO, "x".to_string());
        let other_kind = NodeKey::detached(PACKAGE, "x".to_string());
        let other_args = NodeKey::detached(REPO, "y".to_string());
        let other_type = NodeKey::detached(REPO, 1_u32);

        assert_eq!(a, b);
        assert_ne!(a, other_kind);
        assert_ne!(a, other_args);
        assert_ne!(a, other_type);
    }

    #[test]
    fn test_global_keys_are_shared() {
        let a = NodeKey::new(REPO, ("shared".to_string(), false));
        let b = NodeKey::new(REPO, ("shared".to_string(), false));
        assert!(a.ptr_eq(&b));
        assert_eq!(a.args::<(String, bool)>(), Some(&("shared".to_string(), false)));
        assert_eq!(a.args::<String>(), None);
        assert_eq!(a.kind(), REPO);
    }

    #[test]
    fn test_concurrent_interning_has_one_winner() {
        let interner = KeyInterner::new();
        let keys: Vec<NodeKey> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..64)
                            .map(|i| interner.intern(NodeKey::detached(REPO, i % 4)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(interner.len(), 4);
        for key in &keys {
            let canonical = interner.intern(key.clone());
            assert!(canonical.ptr_eq(key));
        }
    }

    #[test]
    fn test_debug_repr() {
        let key = NodeKey::detached(REPO, "x".to_string());
        assert_eq!(key.debug_repr(), "REPO(\"x\")");
    }
}
