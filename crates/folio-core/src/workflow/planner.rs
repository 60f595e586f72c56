//! Dependency resolution and execution planning for work units.
//!
//! Turns an outline into layers of units that can be generated
//! concurrently. Each pass takes every remaining unit whose dependencies
//! are already planned; a pass that selects nothing while units remain
//! means a cycle, and planning fails instead of forcing units through.

use std::collections::{BTreeMap, HashMap, HashSet};

use folio_types::error::{ErrorCode, StructuredError};
use folio_types::workflow::{ExecutionPlan, WorkUnit};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Index units by number, rejecting duplicates and unknown dependencies.
fn index_units(units: &[WorkUnit]) -> Result<BTreeMap<u32, &WorkUnit>, StructuredError> {
    let mut by_number: BTreeMap<u32, &WorkUnit> = BTreeMap::new();
    for unit in units {
        if by_number.insert(unit.unit_number, unit).is_some() {
            return Err(StructuredError::generic(
                ErrorCode::DuplicateUnit,
                format!("unit {} is declared more than once", unit.unit_number),
            )
            .with_context_field("unit", unit.unit_number));
        }
    }

    for unit in units {
        if let Some(missing) = unit.dependencies.iter().find(|d| !by_number.contains_key(*d)) {
            return Err(StructuredError::generic(
                ErrorCode::UnknownDependency,
                format!("unit {} depends on unknown unit {}", unit.unit_number, missing),
            )
            .with_context_field("unit", unit.unit_number)
            .with_context_field("dependency", *missing));
        }
    }

    Ok(by_number)
}

fn dependency_graph<'a>(
    units: impl Iterator<Item = &'a WorkUnit> + Clone,
) -> (DiGraph<u32, ()>, HashMap<u32, NodeIndex>) {
    let mut graph = DiGraph::<u32, ()>::new();
    let indices: HashMap<u32, NodeIndex> = units
        .clone()
        .map(|u| (u.unit_number, graph.add_node(u.unit_number)))
        .collect();

    for unit in units {
        let to = indices[&unit.unit_number];
        for dep in &unit.dependencies {
            if let Some(&from) = indices.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, indices)
}

/// Units that sit on a dependency cycle, ascending.
fn cycle_members<'a>(units: impl Iterator<Item = &'a WorkUnit> + Clone) -> Vec<u32> {
    let self_loops: HashSet<u32> = units
        .clone()
        .filter(|u| u.dependencies.contains(&u.unit_number))
        .map(|u| u.unit_number)
        .collect();
    let (graph, _) = dependency_graph(units);

    let mut members: Vec<u32> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1 || self_loops.contains(&graph[component[0]]))
        .flatten()
        .map(|idx| graph[idx])
        .collect();
    members.sort_unstable();
    members
}

fn cycle_error(members: Vec<u32>) -> StructuredError {
    let listed = members
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    StructuredError::generic(
        ErrorCode::CircularDependency,
        format!("circular dependency detected among units [{listed}]"),
    )
    .with_context_field("cycle", members)
}

/// Check that an outline forms a valid DAG without computing layers.
pub fn validate_outline(units: &[WorkUnit]) -> Result<(), StructuredError> {
    let by_number = index_units(units)?;
    let (graph, _) = dependency_graph(by_number.values().copied());
    if toposort(&graph, None).is_err() {
        return Err(cycle_error(cycle_members(by_number.values().copied())));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Layering
// ---------------------------------------------------------------------------

/// Build the layered execution plan for an outline.
///
/// Units inside a layer are ordered by ascending unit number, so the same
/// outline always produces the same plan.
pub fn build_execution_plan(units: &[WorkUnit]) -> Result<ExecutionPlan, StructuredError> {
    let by_number = index_units(units)?;
    if by_number.is_empty() {
        return Ok(ExecutionPlan::default());
    }

    let mut remaining = by_number;
    let mut planned: HashSet<u32> = HashSet::new();
    let mut layers: Vec<Vec<u32>> = Vec::new();
    let mut estimated_total_duration_ms: u64 = 0;

    while !remaining.is_empty() {
        let layer: Vec<u32> = remaining
            .values()
            .filter(|u| u.dependencies.iter().all(|d| planned.contains(d)))
            .map(|u| u.unit_number)
            .collect();

        if layer.is_empty() {
            let members = cycle_members(remaining.values().copied());
            tracing::warn!(cycle = ?members, "outline contains a dependency cycle");
            return Err(cycle_error(members));
        }

        let slowest = layer
            .iter()
            .filter_map(|n| remaining.get(n))
            .map(|u| u64::try_from(u.estimated_duration().as_millis()).unwrap_or(u64::MAX))
            .max()
            .unwrap_or(0);
        estimated_total_duration_ms = estimated_total_duration_ms.saturating_add(slowest);

        for n in &layer {
            remaining.remove(n);
        }
        planned.extend(layer.iter().copied());
        layers.push(layer);
    }

    let parallelism_factor = layers.iter().map(Vec::len).max().unwrap_or(0);
    let plan = ExecutionPlan {
        total_units: planned.len(),
        layers,
        parallelism_factor,
        estimated_total_duration_ms,
    };

    tracing::debug!(
        layers = plan.layers.len(),
        total_units = plan.total_units,
        parallelism = plan.parallelism_factor,
        estimated_ms = plan.estimated_total_duration_ms,
        "execution plan built"
    );
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Every unit `unit_number` depends on, directly or indirectly, ascending.
///
/// Unknown unit numbers yield an empty list.
pub fn transitive_dependencies(unit_number: u32, units: &[WorkUnit]) -> Vec<u32> {
    let by_number: HashMap<u32, &WorkUnit> = units.iter().map(|u| (u.unit_number, u)).collect();
    let mut seen: HashSet<u32> = HashSet::new();
    let mut stack: Vec<u32> = by_number
        .get(&unit_number)
        .map(|u| u.dependencies.clone())
        .unwrap_or_default();

    while let Some(dep) = stack.pop() {
        if dep == unit_number || !seen.insert(dep) {
            continue;
        }
        if let Some(unit) = by_number.get(&dep) {
            stack.extend(unit.dependencies.iter().copied());
        }
    }

    let mut deps: Vec<u32> = seen.into_iter().collect();
    deps.sort_unstable();
    deps
}
