//! Dependency graph for task readiness.
//!
//! This module provides the [`DependencyGraph`] that tracks "task B depends
//! on task A" edges, rejects edges that would close a cycle, and reports
//! which tasks become ready (or must be cancelled) when a task finishes.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// How a task in the graph has finished, as far as its dependents care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Still pending, ready, or running.
    Unresolved,
    /// Completed successfully; dependents may proceed.
    Succeeded,
    /// Failed, timed out, or cancelled; dependents are cancelled.
    Failed,
}

#[derive(Debug, Clone)]
struct GraphNode {
    id: TaskId,
    resolution: Resolution,
}

/// A dependent cancelled because a prerequisite failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cascade {
    /// The cancelled task.
    pub task: TaskId,
    /// The direct prerequisite whose failure cancelled it.
    pub dependency: TaskId,
}

/// What a task's completion means for its dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEffect {
    /// Dependents whose prerequisites are now all satisfied.
    Ready(Vec<TaskId>),
    /// Every transitive dependent that can no longer run.
    Cancelled(Vec<Cascade>),
}

impl CompletionEffect {
    pub fn is_empty(&self) -> bool {
        match self {
            CompletionEffect::Ready(ids) => ids.is_empty(),
            CompletionEffect::Cancelled(cascades) => cascades.is_empty(),
        }
    }
}

/// The task dependency graph.
///
/// Uses petgraph's `StableDiGraph` so nodes can be purged without
/// invalidating other indices. An edge `a -> b` means `b` depends on `a`.
/// petgraph keeps both outgoing (dependents) and incoming (prerequisites)
/// adjacency, so readiness checks only touch direct neighbours.
pub struct DependencyGraph {
    graph: StableDiGraph<GraphNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a task node. Adding an existing id returns its existing index.
    pub fn add_task(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(GraphNode {
            id: id.clone(),
            resolution: Resolution::Unresolved,
        });
        self.index.insert(id, index);
        index
    }

    /// Remove a task node and every edge touching it.
    pub fn remove_task(&mut self, id: &TaskId) -> bool {
        match self.index.remove(id) {
            Some(index) => {
                self.graph.remove_node(index);
                true
            }
            None => false,
        }
    }

    /// Record that `id` depends on `depends_on`.
    ///
    /// # Errors
    /// - `TaskNotFound` if either task is unknown
    /// - `CycleDetected` if `id` already reaches `depends_on`; the graph is
    ///   left untouched
    pub fn add_dependency(&mut self, id: &TaskId, depends_on: &TaskId) -> Result<()> {
        self.insert_edge(id, depends_on).map(|_| ())
    }

    fn insert_edge(&mut self, id: &TaskId, depends_on: &TaskId) -> Result<Option<EdgeIndex>> {
        let task_index = self.node(id)?;
        let dep_index = self.node(depends_on)?;

        // The new edge runs dep -> task; a path task ~> dep would close a loop.
        if task_index == dep_index || has_path_connecting(&self.graph, task_index, dep_index, None)
        {
            return Err(Error::CycleDetected {
                task: id.clone(),
                depends_on: depends_on.clone(),
            });
        }

        if self.graph.find_edge(dep_index, task_index).is_some() {
            return Ok(None);
        }
        Ok(Some(self.graph.add_edge(dep_index, task_index, ())))
    }

    /// Insert a batch of tasks with their dependencies atomically.
    ///
    /// Dependencies may point at tasks already in the graph or at other
    /// tasks in the same batch. On any error every node and edge the batch
    /// added is removed again.
    pub fn add_batch(&mut self, entries: &[(TaskId, Vec<TaskId>)]) -> Result<()> {
        let mut added_nodes = Vec::new();
        for (id, _) in entries {
            if !self.contains(id) {
                self.add_task(id.clone());
                added_nodes.push(id.clone());
            }
        }

        let mut added_edges = Vec::new();
        for (id, deps) in entries {
            for dep in deps {
                match self.insert_edge(id, dep) {
                    Ok(Some(edge)) => added_edges.push(edge),
                    Ok(None) => {}
                    Err(err) => {
                        for edge in added_edges {
                            self.graph.remove_edge(edge);
                        }
                        for node in &added_nodes {
                            self.remove_task(node);
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn node(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_dependency(&self, id: &TaskId, depends_on: &TaskId) -> bool {
        match (self.index.get(depends_on), self.index.get(id)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    pub fn resolution(&self, id: &TaskId) -> Option<Resolution> {
        let index = self.index.get(id)?;
        self.graph.node_weight(*index).map(|n| n.resolution)
    }

    /// Direct prerequisites of a task.
    pub fn prerequisites(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Outgoing)
    }

    fn neighbours(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .map(|n| n.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// A task is ready when every prerequisite has succeeded.
    ///
    /// Unknown tasks are never ready.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        match self.index.get(id) {
            Some(&index) => self.prerequisites_succeeded(index),
            None => false,
        }
    }

    fn prerequisites_succeeded(&self, index: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| {
                self.graph
                    .node_weight(dep)
                    .map(|n| n.resolution == Resolution::Succeeded)
                    .unwrap_or(false)
            })
    }

    /// First prerequisite that has already failed, if any.
    pub fn failed_prerequisite(&self, id: &TaskId) -> Option<TaskId> {
        let index = self.index.get(id)?;
        self.graph
            .neighbors_directed(*index, Direction::Incoming)
            .filter_map(|dep| self.graph.node_weight(dep))
            .find(|n| n.resolution == Resolution::Failed)
            .map(|n| n.id.clone())
    }

    /// Resolve a finished task and report the effect on its dependents.
    ///
    /// On success, returns the direct dependents that just became ready. On
    /// failure, marks every unresolved transitive dependent as failed and
    /// returns them, each paired with the prerequisite that cancelled it.
    /// Tasks already resolved (or unknown) produce an empty effect.
    pub fn on_task_completed(&mut self, id: &TaskId, success: bool) -> CompletionEffect {
        let empty = if success {
            CompletionEffect::Ready(Vec::new())
        } else {
            CompletionEffect::Cancelled(Vec::new())
        };
        let Some(&index) = self.index.get(id) else {
            return empty;
        };
        match self.graph.node_weight_mut(index) {
            Some(node) if node.resolution == Resolution::Unresolved => {
                node.resolution = if success {
                    Resolution::Succeeded
                } else {
                    Resolution::Failed
                };
            }
            _ => return empty,
        }

        if success {
            CompletionEffect::Ready(self.newly_ready(index))
        } else {
            CompletionEffect::Cancelled(self.cascade_failure(index))
        }
    }

    fn newly_ready(&self, index: NodeIndex) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .filter(|dependent| seen.insert(*dependent))
            .filter(|dependent| {
                self.graph
                    .node_weight(*dependent)
                    .map(|n| n.resolution == Resolution::Unresolved)
                    .unwrap_or(false)
            })
            .filter(|dependent| self.prerequisites_succeeded(*dependent))
            .filter_map(|dependent| self.graph.node_weight(dependent))
            .map(|n| n.id.clone())
            .collect()
    }

    fn cascade_failure(&mut self, root: NodeIndex) -> Vec<Cascade> {
        let mut cascades = Vec::new();
        let mut frontier = VecDeque::from([root]);

        while let Some(current) = frontier.pop_front() {
            let current_id = match self.graph.node_weight(current) {
                Some(node) => node.id.clone(),
                None => continue,
            };
            let dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .collect();
            for dependent in dependents {
                if let Some(node) = self.graph.node_weight_mut(dependent) {
                    if node.resolution != Resolution::Unresolved {
                        continue;
                    }
                    node.resolution = Resolution::Failed;
                    cascades.push(Cascade {
                        task: node.id.clone(),
                        dependency: current_id.clone(),
                    });
                    frontier.push_back(dependent);
                }
            }
        }
        cascades
    }

    /// Task ids ordered so every task follows all of its prerequisites.
    ///
    /// # Errors
    /// Returns `Validation` if the graph contains a cycle (should never happen
    /// since edges are validated on insert).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task: {}", id))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .map(|n| n.id.clone())
            .collect())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
