//! Task graph construction and ordering.
//!
//! The graph is built once per pass from the generator's task list and is
//! read-only afterwards, so it can be shared across workers behind an `Arc`.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::task::{Task, TaskId};
use crate::error::GraphError;

/// Directed graph of tasks where edges point from a task to its dependencies.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    /// Task ids in the order they were supplied.
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Builds a graph from a task list.
    ///
    /// Dependencies naming tasks outside the list are kept but take no part in
    /// cycle detection.
    ///
    /// # Errors
    ///
    /// - `GraphError::DuplicateTask` if two tasks share an id
    /// - `GraphError::CyclicDependency` if the dependency relation has a cycle
    pub fn build(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut graph = TaskGraph {
            tasks: HashMap::with_capacity(tasks.len()),
            dependencies: HashMap::with_capacity(tasks.len()),
            order: Vec::with_capacity(tasks.len()),
        };

        for task in tasks {
            if graph.tasks.contains_key(&task.id) {
                return Err(GraphError::DuplicateTask(task.id));
            }
            graph.order.push(task.id.clone());
            graph
                .dependencies
                .insert(task.id.clone(), task.dependencies.clone());
            graph.tasks.insert(task.id.clone(), task);
        }

        graph.check_acyclic()?;

        debug!(tasks = graph.len(), "Task graph built");
        Ok(graph)
    }

    /// Depth-first search from every unvisited node, tracking the current path.
    ///
    /// Uses an explicit stack of `(node, next dependency index)` frames so
    /// long dependency chains cannot overflow the call stack.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, usize)> = Vec::new();

        for root in &self.order {
            let root = root.as_str();
            if visited.contains(root) {
                continue;
            }
            visited.insert(root);
            on_stack.insert(root);
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (id, next) = *frame;
                let Some(dep) = self.dependencies_of(id).get(next) else {
                    on_stack.remove(id);
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                let dep = dep.as_str();
                if !self.tasks.contains_key(dep) {
                    continue;
                }
                if on_stack.contains(dep) {
                    let start = stack.iter().position(|(node, _)| *node == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(node, _)| node.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Err(GraphError::CyclicDependency { cycle });
                }
                if visited.insert(dep) {
                    on_stack.insert(dep);
                    stack.push((dep, 0));
                }
            }
        }
        Ok(())
    }

    /// All tasks by descending priority; equal priorities keep insertion order.
    ///
    /// This is not a topological order. Dependency gating, when wanted, is the
    /// scheduler's job.
    pub fn sort_by_priority(&self) -> Vec<Task> {
        let mut sorted: Vec<Task> = self
            .order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect();
        // sort_by is stable
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        sorted
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Declared dependencies of a task, including ones outside the graph.
    pub fn dependencies_of(&self, id: &str) -> &[TaskId] {
        self.dependencies.get(id).map_or(&[], |deps| deps.as_slice())
    }

    /// Dependencies of a task that are themselves nodes of this graph.
    pub fn internal_dependencies_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a TaskId> {
        self.dependencies_of(id)
            .iter()
            .filter(move |dep| self.tasks.contains_key(dep.as_str()))
    }

    /// Tasks that declare a dependency on `id`, in insertion order.
    pub fn dependents_of(&self, id: &str) -> Vec<&TaskId> {
        self.order
            .iter()
            .filter(|candidate| self.dependencies_of(candidate).iter().any(|dep| dep == id))
            .collect()
    }

    /// Task ids in insertion order.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
