//! Invocation planning: expand the requested roots over `depends_on`,
//! prune redundant roots, and compute a topological order for wave
//! scheduling.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use thiserror::Error;

use visor_types::VisorConfig;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),
    #[error("dependency '{dep}' of step '{step}' does not exist")]
    UnknownDependency { step: String, dep: String },
    #[error("dependency cycle involving steps: {0:?}")]
    Cycle(Vec<String>),
}

/// The static execution plan for one invocation. Scope fan-out happens at
/// run time; the plan only fixes membership and ordering.
#[derive(Debug, Clone)]
pub struct Plan {
    /// All selected steps in topological order.
    pub order: Vec<String>,
    /// Requested roots minus any root already reachable from another.
    pub roots: Vec<String>,
    /// Step → position in `order`; used for deterministic start order.
    pub topo_index: HashMap<String, usize>,
    /// Step → OR-groups of real dependency names.
    pub dep_groups: HashMap<String, Vec<Vec<String>>>,
    /// Step → steps that directly depend on it (within the selection).
    pub dependents: HashMap<String, Vec<String>>,
}

impl Plan {
    pub fn contains(&self, step: &str) -> bool {
        self.topo_index.contains_key(step)
    }

    /// Transitive dependencies of `step` within the selection.
    pub fn ancestors(&self, step: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(step);
        while let Some(current) = queue.pop_front() {
            for group in self.dep_groups.get(current).into_iter().flatten() {
                for dep in group {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        seen
    }

    /// `step` plus everything downstream of it within the selection.
    pub fn subtree(&self, step: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        seen.insert(step.to_string());
        queue.push_back(step.to_string());
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(&current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }
        seen
    }
}

/// Build the plan for `requested_roots` (all steps when empty).
pub fn plan(config: &VisorConfig, requested_roots: &[String]) -> Result<Plan, PlanError> {
    let known: HashSet<&str> = config.steps.iter().map(|s| s.name.as_str()).collect();

    let roots: Vec<String> = if requested_roots.is_empty() {
        config.steps.iter().map(|s| s.name.clone()).collect()
    } else {
        requested_roots.to_vec()
    };
    for root in &roots {
        if !known.contains(root.as_str()) {
            return Err(PlanError::UnknownStep(root.clone()));
        }
    }

    // Expand depends_on transitively. OR-tokens only count real names; a
    // token with no real name at all is a broken reference.
    let mut selected: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = roots.iter().cloned().collect();
    let mut dep_groups: HashMap<String, Vec<Vec<String>>> = HashMap::new();
    while let Some(name) = queue.pop_front() {
        if !selected.insert(name.clone()) {
            continue;
        }
        let step = config
            .step(&name)
            .ok_or_else(|| PlanError::UnknownStep(name.clone()))?;
        let mut groups = Vec::new();
        for token in &step.depends_on {
            let candidates: Vec<String> = token
                .split('|')
                .map(str::trim)
                .filter(|n| !n.is_empty() && known.contains(n))
                .map(str::to_string)
                .collect();
            if candidates.is_empty() {
                return Err(PlanError::UnknownDependency {
                    step: name.clone(),
                    dep: token.clone(),
                });
            }
            for candidate in &candidates {
                if !selected.contains(candidate) {
                    queue.push_back(candidate.clone());
                }
            }
            groups.push(candidates);
        }
        dep_groups.insert(name, groups);
    }

    // Prune roots that another root already reaches; the sinks remain.
    let pruned_roots: Vec<String> = roots
        .iter()
        .filter(|root| {
            !roots.iter().any(|other| {
                other != *root && reachable_from(&dep_groups, other, root)
            })
        })
        .cloned()
        .collect();

    // Kahn's algorithm, with configuration order breaking ties.
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for name in &selected {
        in_degree.entry(name.as_str()).or_insert(0);
        for group in dep_groups.get(name).into_iter().flatten() {
            for dep in group {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(name.clone());
            }
        }
    }
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort_by_key(|name| config.step_index(name));

    let mut order = Vec::with_capacity(selected.len());
    while let Some(name) = ready.first().copied() {
        ready.remove(0);
        order.push(name.to_string());
        let mut unlocked = Vec::new();
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    unlocked.push(dependent.as_str());
                }
            }
        }
        ready.extend(unlocked);
        ready.sort_by_key(|n| config.step_index(n));
        ready.dedup();
    }

    if order.len() != selected.len() {
        let stuck: Vec<String> = selected
            .iter()
            .filter(|name| !order.contains(name))
            .cloned()
            .collect();
        return Err(PlanError::Cycle(stuck));
    }

    let topo_index = order
        .iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), index))
        .collect();

    Ok(Plan {
        order,
        roots: pruned_roots,
        topo_index,
        dep_groups,
        dependents,
    })
}

fn reachable_from(
    dep_groups: &HashMap<String, Vec<Vec<String>>>,
    from: &str,
    target: &str,
) -> bool {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(from);
    while let Some(current) = queue.pop_front() {
        for group in dep_groups.get(current).into_iter().flatten() {
            for dep in group {
                if dep == target {
                    return true;
                }
                if seen.insert(dep.as_str()) {
                    queue.push_back(dep);
                }
            }
        }
    }
    false
}
