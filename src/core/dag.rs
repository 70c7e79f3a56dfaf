//! Task graph for dependency management.
//!
//! This module provides the TaskGraph structure that records every live task
//! and the dependencies derived between them. Edges always point from an
//! older task to a newer one, which keeps the graph acyclic by construction.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Kind of dependency between two tasks or two commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The dependent reads data the dependency produced (true dependency).
    Order,
    /// The dependent overwrites data the dependency still needs to read.
    Anti,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Order => write!(f, "order"),
            DependencyKind::Anti => write!(f, "anti"),
        }
    }
}

/// Insert a dependency, letting an order dependency replace an anti one.
pub(crate) fn insert_dependency<K: Ord>(
    deps: &mut BTreeMap<K, DependencyKind>,
    from: K,
    kind: DependencyKind,
) {
    let entry = deps.entry(from).or_insert(kind);
    if kind == DependencyKind::Order {
        *entry = DependencyKind::Order;
    }
}

/// The task dependency graph.
///
/// TaskGraph uses petgraph's StableDiGraph so that pruning old tasks leaves
/// the indices of the remaining tasks intact. Nodes are tasks and edges carry
/// the dependency kind.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: StableDiGraph<Task, DependencyKind>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the graph.
    ///
    /// If a task with the same id already exists, the existing node is kept
    /// and its index returned.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `to` may only run after `from`.
    ///
    /// Adding an order dependency where an anti-dependency already exists
    /// upgrades the edge; the reverse keeps the order dependency.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Either task is not in the graph
    /// - `from` is not older than `to`
    pub fn add_dependency(&mut self, from: TaskId, to: TaskId, kind: DependencyKind) -> Result<()> {
        if from >= to {
            return Err(Error::Validation(format!(
                "Dependency from task {} to task {} does not point forward in time",
                from, to
            )));
        }
        let from_index = *self.task_index.get(&from).ok_or(Error::UnknownTask(from))?;
        let to_index = *self.task_index.get(&to).ok_or(Error::UnknownTask(to))?;

        if let Some(edge) = self.graph.find_edge(from_index, to_index) {
            if let Some(existing) = self.graph.edge_weight_mut(edge) {
                if kind == DependencyKind::Order {
                    *existing = DependencyKind::Order;
                }
            }
            return Ok(());
        }

        self.graph.add_edge(from_index, to_index, kind);
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: TaskId) -> Option<&Task> {
        self.task_index
            .get(&id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: TaskId) -> bool {
        self.task_index.contains_key(&id)
    }

    /// Check if a dependency exists between two tasks.
    pub fn has_dependency(&self, from: TaskId, to: TaskId) -> bool {
        self.get_dependency(from, to).is_some()
    }

    /// Get the dependency kind between two tasks, if one exists.
    pub fn get_dependency(&self, from: TaskId, to: TaskId) -> Option<DependencyKind> {
        let from_idx = self.task_index.get(&from)?;
        let to_idx = self.task_index.get(&to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Get all tasks the given task depends on, sorted by id.
    pub fn get_dependencies(&self, id: TaskId) -> Vec<(TaskId, DependencyKind)> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task, sorted by id.
    pub fn get_dependents(&self, id: TaskId) -> Vec<(TaskId, DependencyKind)> {
        self.neighbours(id, Direction::Outgoing)
    }

    fn neighbours(&self, id: TaskId, direction: Direction) -> Vec<(TaskId, DependencyKind)> {
        let Some(&index) = self.task_index.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<(TaskId, DependencyKind)> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|other| {
                let edge = match direction {
                    Direction::Incoming => self.graph.find_edge(other, index),
                    Direction::Outgoing => self.graph.find_edge(index, other),
                }?;
                let task = self.graph.node_weight(other)?;
                Some((task.id, *self.graph.edge_weight(edge)?))
            })
            .collect();
        out.sort();
        out
    }

    /// All tasks, sorted by id.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .graph
            .node_indices()
            .filter_map(|index| self.graph.node_weight(index))
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// All edges as (dependency, dependent, kind), sorted.
    pub fn edges(&self) -> Vec<(TaskId, TaskId, DependencyKind)> {
        let mut out: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|edge| {
                let (source, target) = self.graph.edge_endpoints(edge)?;
                let from = self.graph.node_weight(source)?;
                let to = self.graph.node_weight(target)?;
                Some((from.id, to.id, *self.graph.edge_weight(edge)?))
            })
            .collect();
        out.sort();
        out
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle, which add_dependency
    /// rules out.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task {}", id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Remove every task older than `epoch`.
    ///
    /// Returns the number of removed tasks. Edges touching removed tasks go
    /// with them, so no remaining task refers to anything older than `epoch`.
    pub fn prune_before(&mut self, epoch: TaskId) -> usize {
        let stale: Vec<TaskId> = self
            .task_index
            .keys()
            .copied()
            .filter(|id| *id < epoch)
            .collect();
        for id in &stale {
            if let Some(index) = self.task_index.remove(id) {
                self.graph.remove_node(index);
            }
        }
        stale.len()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
