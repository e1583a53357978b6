//! Dependency optimization: prune dangling references, then order steps with
//! Kahn's algorithm.
//!
//! The ready set is a min-heap keyed by original position, so independent
//! steps keep their relative order and an already valid order comes back
//! unchanged.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use taskpilot_core::Step;
use tracing::debug;

use crate::error::ValidationError;

/// Reject duplicate step ids; dependency edges would be ambiguous.
pub fn ensure_unique_ids(steps: &[Step]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }
    Ok(())
}

/// Drop `depends_on` entries naming steps that are not in the plan, and
/// collapse repeated entries. Returns the `(step, dependency)` pairs removed.
pub fn prune_dangling(steps: &mut [Step]) -> Vec<(String, String)> {
    let ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();
    let mut removed = Vec::new();

    for step in steps.iter_mut() {
        let mut kept: Vec<String> = Vec::with_capacity(step.depends_on.len());
        for dep in step.depends_on.drain(..) {
            if !ids.contains(&dep) {
                debug!(step_id = %step.id, dependency = %dep, "Dropping dangling dependency");
                removed.push((step.id.clone(), dep));
            } else if !kept.contains(&dep) {
                kept.push(dep);
            }
        }
        step.depends_on = kept;
    }

    removed
}

/// Stable topological order. Fails with the ids left unordered when the
/// dependencies contain a cycle.
pub fn topological_sort(steps: Vec<Step>) -> Result<Vec<Step>, ValidationError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < steps.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let cyclic = steps
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed.contains(i))
            .map(|(_, s)| s.id.clone())
            .collect();
        return Err(ValidationError::DependencyCycle { steps: cyclic });
    }

    let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

/// Prune then sort.
pub fn optimize_dependencies(mut steps: Vec<Step>) -> Result<Vec<Step>, ValidationError> {
    ensure_unique_ids(&steps)?;
    prune_dangling(&mut steps);
    topological_sort(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::model(id).depends_on(deps.iter().copied())
    }

    fn ids(steps: &[Step]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_independent_steps_keep_order() {
        let sorted =
            topological_sort(vec![step("c", &[]), step("a", &[]), step("b", &[])]).unwrap();
        assert_eq!(ids(&sorted), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_join_placed_after_both_parents() {
        let sorted = topological_sort(vec![
            step("c", &["a", "b"]),
            step("a", &[]),
            step("b", &[]),
        ])
        .unwrap();
        assert_eq!(ids(&sorted), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_valid_order_is_unchanged() {
        let input = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("x", &[]),
            step("c", &["b", "x"]),
        ];
        let sorted = topological_sort(input.clone()).unwrap();
        assert_eq!(sorted, input);
    }

    #[test]
    fn test_ties_prefer_earlier_position() {
        // d becomes ready after a; b is already ready but comes later in input
        let sorted = topological_sort(vec![
            step("a", &[]),
            step("d", &["a"]),
            step("b", &[]),
        ])
        .unwrap();
        assert_eq!(ids(&sorted), vec!["a", "d", "b"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = topological_sort(vec![
            step("a", &["b"]),
            step("b", &["a"]),
            step("c", &[]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DependencyCycle {
                steps: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = optimize_dependencies(vec![step("a", &["a"])]).unwrap_err();
        assert!(matches!(err, ValidationError::DependencyCycle { .. }));
    }

    #[test]
    fn test_dangling_dependencies_are_dropped() {
        let mut steps = vec![step("a", &[]), step("b", &["a", "ghost", "a"])];
        let removed = prune_dangling(&mut steps);
        assert_eq!(removed, vec![("b".to_string(), "ghost".to_string())]);
        assert_eq!(steps[1].depends_on, vec!["a".to_string()]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = optimize_dependencies(vec![step("a", &[]), step("a", &[])]).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateStepId("a".to_string()));
    }
}
