//! Tests for evaluation: memoization, restarts, and cancellation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nodeflow::{
    ComputeError, EvalError, EvaluationOptions, Evaluator, Interrupt, Kind, NodeKey, NodeState,
    Value,
};

const LEAF: Kind = Kind::new("LEAF");
const SUM: Kind = Kind::new("SUM");
const STEPS: Kind = Kind::new("STEPS");
const REPO: Kind = Kind::new("REPO");
const FAIL: Kind = Kind::new("FAIL");
const SLOW: Kind = Kind::new("SLOW");

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn as_i64(value: &Value) -> i64 {
    *value.downcast_ref::<i64>().unwrap()
}

// =============================================================================
// Memoization
// =============================================================================

#[test]
fn test_memoization() {
    let runs = counter();
    let evaluator = Evaluator::builder()
        .register_fn(LEAF, {
            let runs = runs.clone();
            move |key, _env| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Value::new(*key.args::<i64>().unwrap_or(&0) * 10))
            }
        })
        .build();

    let key = NodeKey::new(LEAF, 4_i64);
    assert_eq!(as_i64(&evaluator.evaluate_one(&key).unwrap()), 40);
    assert_eq!(as_i64(&evaluator.evaluate_one(&key).unwrap()), 40);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shared_dependency_is_computed_once() {
    let leaf_runs = counter();
    let evaluator = Evaluator::builder()
        .workers(4)
        .register_fn(LEAF, {
            let leaf_runs = leaf_runs.clone();
            move |key, _env| {
                leaf_runs.fetch_add(1, Ordering::SeqCst);
                Ok(Value::new(*key.args::<i64>().unwrap_or(&0)))
            }
        })
        .register_fn(SUM, |key, env| {
            let n = *key.args::<i64>().unwrap_or(&0);
            let keys: Vec<NodeKey> = (0..n).map(|i| NodeKey::new(LEAF, i % 3)).collect();
            let values = env.request_all(&keys)?;
            Ok(Value::new(values.iter().map(as_i64).sum::<i64>()))
        })
        .build();

    let roots: Vec<NodeKey> = (1..=6).map(|n| NodeKey::new(SUM, n as i64)).collect();
    let result = evaluator
        .evaluate(roots.clone(), &EvaluationOptions::new())
        .unwrap();

    assert_eq!(result.len(), 6);
    assert!(!result.has_errors());
    assert!(!result.interrupted());
    // 0 + 1 + 2 + 0 + 1 + 2
    assert_eq!(as_i64(result.value(&roots[5]).unwrap()), 6);
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Restart Protocol
// =============================================================================

#[test]
fn test_restart_serves_satisfied_dependencies_from_graph() {
    let leaf_runs = counter();
    let step_runs = counter();
    let evaluator = Evaluator::builder()
        .workers(2)
        .register_fn(LEAF, {
            let leaf_runs = leaf_runs.clone();
            move |key, _env| {
                leaf_runs.fetch_add(1, Ordering::SeqCst);
                Ok(Value::new(*key.args::<i64>().unwrap_or(&0)))
            }
        })
        .register_fn(STEPS, {
            let step_runs = step_runs.clone();
            move |_key, env| {
                step_runs.fetch_add(1, Ordering::SeqCst);
                // Each round depends on the previous value, so the rounds
                // cannot be requested together.
                let first = as_i64(&env.request(&NodeKey::new(LEAF, 1_i64))?);
                let second = as_i64(&env.request(&NodeKey::new(LEAF, first + 1))?);
                let third = as_i64(&env.request(&NodeKey::new(LEAF, second + 1))?);
                Ok(Value::new(first + second + third))
            }
        })
        .build();

    let root = NodeKey::new(STEPS, ());
    assert_eq!(as_i64(&evaluator.evaluate_one(&root).unwrap()), 6);
    assert_eq!(step_runs.load(Ordering::SeqCst), 4);
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 3);

    let deps = evaluator.graph().get(&root).unwrap().dependencies();
    assert_eq!(deps.group_count(), 3);
    let keys: Vec<NodeKey> = deps.keys().cloned().collect();
    assert_eq!(
        keys,
        vec![
            NodeKey::new(LEAF, 1_i64),
            NodeKey::new(LEAF, 2_i64),
            NodeKey::new(LEAF, 3_i64)
        ]
    );
}

#[test]
fn test_restart_round_is_visible_to_functions() {
    let rounds = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let evaluator = Evaluator::builder()
        .register_fn(LEAF, |_key, _env| Ok(Value::new(0_i64)))
        .register_fn(STEPS, {
            let rounds = rounds.clone();
            move |_key, env| {
                rounds.lock().push(env.restart_round());
                let a = env.request(&NodeKey::new(LEAF, 100_i64));
                assert_eq!(env.values_missing(), a.is_err());
                let a = a?;
                Ok(a)
            }
        })
        .build();
    evaluator.evaluate_one(&NodeKey::new(STEPS, "rounds")).unwrap();
    assert_eq!(*rounds.lock(), vec![0, 1]);
}

// =============================================================================
// Repository Mapping Scenario
// =============================================================================

/// A repository mapping with a lazily built inverse. The inverse is derived
/// data and is left out of equality.
#[derive(Debug, Clone)]
struct RepoMapping {
    entries: BTreeMap<String, String>,
    inverse: BTreeMap<String, String>,
}

impl RepoMapping {
    fn new(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries,
            inverse: BTreeMap::new(),
        }
    }

    fn with_cached_inverse(mut self) -> Self {
        self.inverse = self
            .entries
            .iter()
            .map(|(k, v)| (v.clone(), k.clone()))
            .collect();
        self
    }
}

impl PartialEq for RepoMapping {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

#[test]
fn test_repo_scenario() {
    let x_runs = counter();
    let y_runs = counter();
    let generation = counter();
    let evaluator = Evaluator::builder()
        .register_fn(REPO, {
            let x_runs = x_runs.clone();
            let y_runs = y_runs.clone();
            let generation = generation.clone();
            move |key, env| {
                let name = key.args::<String>().cloned().unwrap_or_default();
                if name == "x" {
                    x_runs.fetch_add(1, Ordering::SeqCst);
                    let mut entries = BTreeMap::new();
                    entries.insert("@x".to_string(), "x~1.0".to_string());
                    let mapping = RepoMapping::new(entries);
                    // Only every other computation caches the inverse.
                    let mapping = if generation.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                        mapping.with_cached_inverse()
                    } else {
                        mapping
                    };
                    return Ok(Value::new(mapping));
                }
                y_runs.fetch_add(1, Ordering::SeqCst);
                let x = env.request(&NodeKey::new(REPO, "x".to_string()))?;
                let x = x
                    .downcast_ref::<RepoMapping>()
                    .ok_or_else(|| ComputeError::msg("REPO(x) is not a mapping"))?;
                let mut entries = x.entries.clone();
                entries.insert("@y".to_string(), "y~2.0".to_string());
                Ok(Value::new(RepoMapping::new(entries)))
            }
        })
        .build();

    let x = NodeKey::new(REPO, "x".to_string());
    let y = NodeKey::new(REPO, "y".to_string());

    let first = evaluator.evaluate_one(&y).unwrap();
    let mapping = first.downcast_ref::<RepoMapping>().unwrap();
    assert_eq!(mapping.entries.len(), 2);
    assert_eq!(mapping.entries.get("@x").map(String::as_str), Some("x~1.0"));
    assert!(mapping.inverse.is_empty());
    assert_eq!(x_runs.load(Ordering::SeqCst), 1);
    assert_eq!(y_runs.load(Ordering::SeqCst), 2);
    let y_version = evaluator.graph().get(&y).unwrap().version();

    evaluator.invalidate([x.clone()]);
    assert_eq!(evaluator.graph().get(&y).unwrap().state(), NodeState::Dirty);

    let second = evaluator.evaluate_one(&y).unwrap();
    assert_eq!(second, first);
    assert_eq!(x_runs.load(Ordering::SeqCst), 2);
    assert_eq!(y_runs.load(Ordering::SeqCst), 2);
    assert_eq!(evaluator.graph().get(&y).unwrap().version(), y_version);
    assert_eq!(evaluator.graph().get(&x).unwrap().state(), NodeState::Done);
}

// =============================================================================
// Errors At The Root
// =============================================================================

#[test]
fn test_every_failed_root_is_reported() {
    let evaluator = Evaluator::builder()
        .register_fn(LEAF, |key, _env| Ok(Value::new(*key.args::<i64>().unwrap_or(&0))))
        .register_fn(FAIL, |key, _env| {
            Err(ComputeError::msg(format!("{key:?} failed")))
        })
        .build();
    let ok = NodeKey::new(LEAF, 1_i64);
    let bad_a = NodeKey::new(FAIL, 1_i64);
    let bad_b = NodeKey::new(FAIL, 2_i64);
    let result = evaluator
        .evaluate(
            [ok.clone(), bad_a.clone(), bad_b.clone()],
            &EvaluationOptions::new(),
        )
        .unwrap();
    assert!(result.value(&ok).is_some());
    assert_eq!(result.error(&bad_a).unwrap().to_string(), "FAIL(1) failed");
    assert_eq!(result.error(&bad_b).unwrap().to_string(), "FAIL(2) failed");
    assert!(!result.interrupted());
}

#[test]
fn test_keep_going_false_stops_dispatch() {
    let slow_runs = counter();
    let evaluator = Evaluator::builder()
        .workers(1)
        .register_fn(FAIL, |_key, _env| Err(ComputeError::msg("boom")))
        .register_fn(SLOW, {
            let slow_runs = slow_runs.clone();
            move |key, env| {
                slow_runs.fetch_add(1, Ordering::SeqCst);
                let n = *key.args::<i64>().unwrap_or(&0);
                if n == 0 {
                    return Ok(Value::new(0_i64));
                }
                let below = env.request(&NodeKey::new(SLOW, n - 1))?;
                Ok(Value::new(as_i64(&below) + 1))
            }
        })
        .build();

    let bad = NodeKey::new(FAIL, 0_i64);
    let long = NodeKey::new(SLOW, 50_i64);
    let result = evaluator
        .evaluate(
            [bad.clone(), long.clone()],
            &EvaluationOptions::new().keep_going(false),
        )
        .unwrap();
    assert_eq!(result.error(&bad).unwrap().to_string(), "boom");
    assert!(matches!(result.error(&long), Some(EvalError::Interrupted)));
    assert!(result.interrupted());
    assert!(slow_runs.load(Ordering::SeqCst) < 100);
    assert_ne!(evaluator.graph().get(&long).unwrap().state(), NodeState::InProgress);

    // Without the failing root the chain completes, reusing what was done.
    let value = evaluator.evaluate_one(&long).unwrap();
    assert_eq!(as_i64(&value), 50);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_pre_interrupted_evaluation_runs_nothing() {
    let runs = counter();
    let evaluator = Evaluator::builder()
        .register_fn(LEAF, {
            let runs = runs.clone();
            move |_key, _env| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Value::new(1_i64))
            }
        })
        .build();
    let interrupt = Interrupt::new();
    interrupt.interrupt();
    let key = NodeKey::new(LEAF, 99_i64);
    let result = evaluator
        .evaluate([key.clone()], &EvaluationOptions::new().with_interrupt(interrupt))
        .unwrap();
    assert!(matches!(result.error(&key), Some(EvalError::Interrupted)));
    assert!(result.interrupted());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_interrupt_keeps_completed_nodes() {
    let slow_runs = counter();
    let interrupt = Interrupt::new();
    let evaluator = Evaluator::builder()
        .workers(2)
        .register_fn(SLOW, {
            let slow_runs = slow_runs.clone();
            let interrupt = interrupt.clone();
            move |key, env| {
                slow_runs.fetch_add(1, Ordering::SeqCst);
                let n = *key.args::<i64>().unwrap_or(&0);
                if n == 0 {
                    return Ok(Value::new(0_i64));
                }
                let below = env.request(&NodeKey::new(SLOW, n - 1))?;
                if n == 5 {
                    interrupt.interrupt();
                    assert!(env.is_interrupted());
                }
                Ok(Value::new(as_i64(&below) + 1))
            }
        })
        .build();

    let root = NodeKey::new(SLOW, 10_i64);
    let result = evaluator
        .evaluate(
            [root.clone()],
            &EvaluationOptions::new().with_interrupt(interrupt),
        )
        .unwrap();
    assert!(result.interrupted());
    assert!(matches!(result.error(&root), Some(EvalError::Interrupted)));
    for n in 0..=10_i64 {
        let state = evaluator.graph().get(&NodeKey::new(SLOW, n)).unwrap().state();
        let expected = if n <= 5 { NodeState::Done } else { NodeState::New };
        assert_eq!(state, expected, "SLOW({n})");
    }

    // Resuming only runs the nodes above the interrupt point: each of them
    // once to discover its dependency and once to produce its value.
    let before = slow_runs.load(Ordering::SeqCst);
    let value = evaluator.evaluate_one(&root).unwrap();
    assert_eq!(as_i64(&value), 10);
    assert_eq!(slow_runs.load(Ordering::SeqCst) - before, 10);
}
