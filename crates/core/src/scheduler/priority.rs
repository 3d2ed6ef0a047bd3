//! Dependency graph passes over the pending set.
//!
//! Both functions only look at edges between *pending* tasks; a dependency
//! on an id that is not pending (completed, active, or never submitted)
//! contributes nothing to inheritance and cannot close a cycle.

use std::collections::{HashMap, VecDeque};

/// Compute effective priorities for every pending task.
///
/// A task's effective priority is the maximum of its own priority and the
/// effective priority of every pending task that transitively depends on it.
/// Kahn's algorithm orders the walk so each task is visited only after all
/// of its dependents, so one pass propagates priorities down any chain
/// without recursion.
pub fn effective_priorities<'a, I>(tasks: I) -> HashMap<String, i64>
where
    I: IntoIterator<Item = (&'a str, i64, &'a [String])>,
{
    let nodes: HashMap<&'a str, (i64, &'a [String])> =
        tasks.into_iter().map(|(id, priority, deps)| (id, (priority, deps))).collect();

    let mut effective: HashMap<&'a str, i64> =
        nodes.iter().map(|(id, (priority, _))| (*id, *priority)).collect();

    // Number of pending dependents each task is still waiting to hear from.
    let mut open_dependents: HashMap<&'a str, usize> = nodes.keys().map(|id| (*id, 0)).collect();
    for (_, deps) in nodes.values() {
        for dep in deps.iter() {
            if let Some(count) = open_dependents.get_mut(dep.as_str()) {
                *count += 1;
            }
        }
    }

    let mut ready: VecDeque<&'a str> =
        open_dependents.iter().filter(|(_, count)| **count == 0).map(|(id, _)| *id).collect();
    let mut visited = 0usize;

    while let Some(id) = ready.pop_front() {
        visited += 1;
        let Some(&(_, deps)) = nodes.get(id) else { continue };
        let inherited = effective.get(id).copied().unwrap_or(i64::MIN);

        for dep in deps.iter() {
            let dep = dep.as_str();
            if let Some(current) = effective.get_mut(dep) {
                *current = (*current).max(inherited);
            }
            if let Some(count) = open_dependents.get_mut(dep) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(dep);
                }
            }
        }
    }

    if visited < nodes.len() {
        tracing::warn!(
            unvisited = nodes.len() - visited,
            "pending dependency graph contains a cycle; affected tasks keep their own priority"
        );
    }

    effective.into_iter().map(|(id, priority)| (id.to_string(), priority)).collect()
}

/// Look for a cycle that submitting `new_id` with `dependencies` would close.
///
/// `dependencies_of` returns the dependency list of a pending task. Returns
/// the cycle as `new_id -> ... -> new_id` when one exists.
pub fn find_cycle<'a, F>(
    new_id: &'a str,
    dependencies: &'a [String],
    dependencies_of: F,
) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<&'a [String]>,
{
    if dependencies.iter().any(|dep| dep == new_id) {
        return Some(vec![new_id.to_string(), new_id.to_string()]);
    }

    // Breadth-first walk along "depends on" edges; `reached_from` records
    // which task led to each id so the path can be rebuilt.
    let mut reached_from: HashMap<&'a str, &'a str> = HashMap::new();
    let mut queue: VecDeque<&'a str> = VecDeque::new();
    for dep in dependencies {
        if reached_from.insert(dep.as_str(), new_id).is_none() {
            queue.push_back(dep.as_str());
        }
    }

    while let Some(current) = queue.pop_front() {
        let Some(deps) = dependencies_of(current) else { continue };
        for dep in deps {
            let dep = dep.as_str();
            if dep == new_id {
                let mut path = vec![current.to_string()];
                let mut cursor = current;
                while let Some(prev) = reached_from.get(cursor).copied() {
                    if prev == new_id {
                        break;
                    }
                    path.push(prev.to_string());
                    cursor = prev;
                }
                path.push(new_id.to_string());
                path.reverse();
                path.push(new_id.to_string());
                return Some(path);
            }
            if !reached_from.contains_key(dep) {
                reached_from.insert(dep, current);
                queue.push_back(dep);
            }
        }
    }

    None
}
