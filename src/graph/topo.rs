//! Dependency ordering for task graphs

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::core::errors::{Result, RunbookError};
use crate::graph::model::{Task, TaskGraph, TaskId};

/// Structural checks run before a graph is ordered or executed:
/// unique ids and no dangling `depends_on` references.
pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    for (idx, task) in tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            return Err(RunbookError::validation(format!(
                "task at position {} has an empty id",
                idx
            )));
        }
        if seen.insert(task.id.as_str(), idx).is_some() {
            return Err(RunbookError::validation_task(
                format!("duplicate task id '{}'", task.id),
                task.id.clone(),
            ));
        }
    }

    for task in tasks {
        for dep in &task.depends_on {
            if !seen.contains_key(dep.as_str()) {
                return Err(RunbookError::validation_task(
                    format!("dependency '{}' for task '{}' not found", dep, task.id),
                    task.id.clone(),
                ));
            }
        }
    }
    Ok(())
}

/// Validate ids and dependencies, then make sure the graph is acyclic
pub fn validate_graph(graph: &TaskGraph) -> Result<()> {
    topological_sort(&graph.tasks).map(|_| ())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Order tasks so each appears after everything it depends on.
///
/// Depth-first with three-color marking. Ties between independent tasks are
/// broken by insertion order. Dangling dependencies are rejected before any
/// ordering happens.
pub fn topological_sort(tasks: &[Task]) -> Result<Vec<&Task>> {
    validate_tasks(tasks)?;

    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; tasks.len()];
    let mut order = Vec::with_capacity(tasks.len());

    for start in 0..tasks.len() {
        visit(start, tasks, &index, &mut marks, &mut order)?;
    }

    Ok(order.into_iter().map(|i| &tasks[i]).collect())
}

/// Depth-first walk from `start` on an explicit stack, so long dependency
/// chains cannot exhaust the call stack
fn visit(
    start: usize,
    tasks: &[Task],
    index: &HashMap<&str, usize>,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) -> Result<()> {
    if marks[start] != Mark::Unvisited {
        return Ok(());
    }

    // (task, position of its next dependency to look at)
    let mut stack = vec![(start, 0usize)];
    marks[start] = Mark::Visiting;

    while let Some(top) = stack.last_mut() {
        let (idx, next) = *top;
        let Some(dep) = tasks[idx].depends_on.get(next) else {
            marks[idx] = Mark::Visited;
            order.push(idx);
            stack.pop();
            continue;
        };
        top.1 += 1;

        let dep_idx = index.get(dep.as_str()).copied().ok_or_else(|| {
            RunbookError::validation_task(
                format!("dependency '{}' for task '{}' not found", dep, tasks[idx].id),
                tasks[idx].id.clone(),
            )
        })?;
        match marks[dep_idx] {
            Mark::Visited => {}
            Mark::Visiting => return Err(RunbookError::cyclic(tasks[dep_idx].id.clone())),
            Mark::Unvisited => {
                marks[dep_idx] = Mark::Visiting;
                stack.push((dep_idx, 0));
            }
        }
    }
    Ok(())
}

/// Ids in execution order
pub fn sorted_ids(tasks: &[Task]) -> Result<Vec<TaskId>> {
    Ok(topological_sort(tasks)?
        .into_iter()
        .map(|t| t.id.clone())
        .collect())
}

/// Build a petgraph view with an edge from each dependency to its dependent
pub fn dependency_graph(tasks: &[Task]) -> Result<(DiGraph<TaskId, ()>, HashMap<TaskId, NodeIndex>)> {
    validate_tasks(tasks)?;

    let mut graph = DiGraph::new();
    let mut indices = HashMap::with_capacity(tasks.len());
    for task in tasks {
        let idx = graph.add_node(task.id.clone());
        indices.insert(task.id.clone(), idx);
    }
    for task in tasks {
        let to = indices[&task.id];
        for dep in &task.depends_on {
            graph.add_edge(indices[dep], to, ());
        }
    }
    Ok((graph, indices))
}

/// Group tasks by dependency depth. Level 0 has no dependencies; every other
/// task sits one level below its deepest dependency. Ids within a level keep
/// insertion order.
pub fn execution_levels(tasks: &[Task]) -> Result<Vec<Vec<TaskId>>> {
    let order = topological_sort(tasks)?;
    let (graph, indices) = dependency_graph(tasks)?;

    let mut node_levels: HashMap<NodeIndex, usize> = HashMap::new();
    for task in &order {
        let node_idx = indices[&task.id];
        let level = graph
            .edges_directed(node_idx, Direction::Incoming)
            .filter_map(|edge| node_levels.get(&edge.source()).map(|l| l + 1))
            .max()
            .unwrap_or(0);
        node_levels.insert(node_idx, level);
    }

    let mut levels: Vec<Vec<TaskId>> = Vec::new();
    for task in tasks {
        let level = node_levels[&indices[&task.id]];
        while levels.len() <= level {
            levels.push(Vec::new());
        }
        levels[level].push(task.id.clone());
    }
    Ok(levels)
}
