//! Deterministic validation rules for work-item mutations.
//!
//! Every function here is pure over `&LoopState` and returns
//! `Err(message)` with a human-readable rejection reason.

use std::collections::{BTreeSet, HashSet};

use crate::config::DispatchConfig;
use crate::state::{ItemStatus, LoopState, Origin};

use super::Caller;

/// Lowercase alphanumeric tokens of `text`.
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard overlap of the token sets of `a` and `b`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    shared as f64 / union as f64
}

/// First non-terminal item whose description is at least `threshold`
/// similar to `description`.
pub fn find_duplicate<'a>(
    state: &'a LoopState,
    description: &str,
    threshold: f64,
) -> Option<(&'a str, f64)> {
    state
        .work_items
        .values()
        .filter(|item| !item.status.is_terminal())
        .map(|item| (item.id.as_str(), similarity(&item.description, description)))
        .find(|(_, score)| *score >= threshold)
}

/// Open (non-terminal) items that did not come from the plan.
pub fn open_unplanned(state: &LoopState) -> usize {
    state
        .work_items
        .values()
        .filter(|i| !i.status.is_terminal() && i.origin != Origin::Plan)
        .count()
}

/// Whether `to` can reach `from` by following dependency edges.
///
/// Adding the edge `from -> to` creates a cycle exactly when this holds.
pub fn reaches(state: &LoopState, to: &str, from: &str) -> bool {
    let mut stack = vec![to];
    let mut seen: HashSet<&str> = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == from {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(item) = state.work_items.get(current) {
            stack.extend(item.dependencies.iter().map(String::as_str));
        }
    }
    false
}

/// Origin to record for an item created by `caller`.
pub fn resolve_origin(caller: Caller, requested: Option<Origin>) -> Result<Origin, String> {
    use crate::agent::AgentRole;

    let default = match caller {
        Caller::Human => Origin::Human,
        Caller::Agent(AgentRole::Planner) => Origin::Plan,
        Caller::Agent(AgentRole::Researcher) => Origin::Research,
        Caller::Agent(_) => Origin::Agent,
    };
    let Some(origin) = requested else {
        return Ok(default);
    };

    let permitted = match caller {
        Caller::Human => true,
        Caller::Agent(AgentRole::Planner) => origin != Origin::Human,
        Caller::Agent(_) => !matches!(origin, Origin::Plan | Origin::Human),
    };
    if permitted {
        Ok(origin)
    } else {
        Err(format!("{caller} may not create items with origin {origin:?}"))
    }
}

/// Fields of a proposed new item that validation looks at.
#[derive(Debug, Clone, Copy)]
pub struct NewItem<'a> {
    pub id: &'a str,
    pub description: &'a str,
    pub value: &'a str,
    pub acceptance: &'a str,
    pub dependencies: &'a [String],
    pub declared_files: usize,
    pub origin: Origin,
}

/// Rules for adding a work item.
pub fn validate_add(
    state: &LoopState,
    config: &DispatchConfig,
    item: &NewItem<'_>,
) -> Result<(), String> {
    for (field, text) in [
        ("description", item.description),
        ("value", item.value),
        ("acceptance", item.acceptance),
    ] {
        if text.trim().is_empty() {
            return Err(format!("Rejected: '{field}' must not be empty"));
        }
    }

    if state.work_items.contains_key(item.id) {
        return Err(format!("Rejected: work item '{}' already exists", item.id));
    }

    if let Some((existing, score)) =
        find_duplicate(state, item.description, config.duplicate_similarity)
    {
        return Err(format!(
            "Rejected: duplicate of '{existing}' (similarity {score:.2} >= {:.2})",
            config.duplicate_similarity
        ));
    }

    if item.origin != Origin::Plan && open_unplanned(state) >= config.max_open_items {
        return Err(format!(
            "Rejected: {} open unplanned items already (limit {}); finish or descope some first",
            open_unplanned(state),
            config.max_open_items
        ));
    }

    if let Some(missing) = item
        .dependencies
        .iter()
        .find(|d| !state.work_items.contains_key(d.as_str()))
    {
        return Err(format!("Rejected: dependency '{missing}' does not exist"));
    }

    check_granularity(config, item.description, item.declared_files)
}

/// Granularity caps: oversized items must be split.
pub fn check_granularity(
    config: &DispatchConfig,
    description: &str,
    declared_files: usize,
) -> Result<(), String> {
    let chars = description.chars().count();
    if chars > config.max_description_chars {
        return Err(format!(
            "Rejected: description is {chars} chars (limit {}); split the item",
            config.max_description_chars
        ));
    }
    if declared_files > config.max_declared_files {
        return Err(format!(
            "Rejected: item declares {declared_files} files (limit {}); split the item",
            config.max_declared_files
        ));
    }
    Ok(())
}

/// Rules for replacing an item's dependency list.
pub fn validate_dependencies(
    state: &LoopState,
    id: &str,
    proposed: &[String],
) -> Result<(), String> {
    let current: HashSet<&str> = state
        .work_items
        .get(id)
        .map(|i| i.dependencies.iter().map(String::as_str).collect())
        .unwrap_or_default();

    for dep in proposed {
        if dep == id {
            return Err(format!("Rejected: '{id}' cannot depend on itself"));
        }
        if !state.work_items.contains_key(dep.as_str()) {
            return Err(format!("Rejected: dependency '{dep}' does not exist"));
        }
        if !current.contains(dep.as_str()) && reaches(state, dep, id) {
            return Err(format!(
                "Rejected: dependency cycle ('{dep}' already depends on '{id}')"
            ));
        }
    }
    Ok(())
}

/// Rules for a status transition.
pub fn validate_status_change(
    caller: Caller,
    current: ItemStatus,
    next: ItemStatus,
) -> Result<(), String> {
    if current == ItemStatus::Descoped && next != ItemStatus::Descoped && !caller.is_human() {
        return Err("Rejected: descoped items can only be restored by a human".to_string());
    }
    Ok(())
}

/// Rules for removing an item.
pub fn validate_remove(state: &LoopState, id: &str) -> Result<(), String> {
    if !state.work_items.contains_key(id) {
        return Err(format!("Rejected: work item '{id}' does not exist"));
    }
    let dependents: Vec<&str> = state
        .work_items
        .values()
        .filter(|i| i.dependencies.iter().any(|d| d == id))
        .map(|i| i.id.as_str())
        .collect();
    if !dependents.is_empty() {
        return Err(format!(
            "Rejected: '{id}' is a dependency of {}",
            dependents.join(", ")
        ));
    }
    Ok(())
}
