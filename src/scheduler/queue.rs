//! Task queues drained by the worker pool.
//!
//! Both queues are populated once, before workers start, and never grow.
//!
//! - [`PriorityQueue`]: a closed channel of tasks in descending priority.
//!   Declared dependencies are not consulted.
//! - [`DependencyQueue`]: a ready queue that releases a task only after every
//!   dependency inside the graph has completed. Tasks whose dependency failed
//!   are handed out as [`Dispatch::Skip`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::graph::{Task, TaskGraph, TaskId};

/// What a worker should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Execute this task.
    Run(Task),
    /// Do not execute; a dependency did not complete.
    Skip {
        task: Task,
        failed_dependency: TaskId,
    },
}

impl Dispatch {
    pub fn task(&self) -> &Task {
        match self {
            Dispatch::Run(task) | Dispatch::Skip { task, .. } => task,
        }
    }
}

/// A pre-populated source of work.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Next unit of work, or `None` once the queue is drained.
    async fn next(&self) -> Option<Dispatch>;

    /// Reports the outcome of a task handed out by [`next`](Self::next).
    async fn complete(&self, task_id: &str, succeeded: bool);

    /// Number of tasks not yet handed out.
    fn remaining(&self) -> usize;
}

/// Closed channel of tasks in descending priority order.
pub struct PriorityQueue {
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Task>>,
    remaining: std::sync::atomic::AtomicUsize,
}

impl PriorityQueue {
    /// Fills the channel from the graph's priority order and closes it.
    pub fn from_graph(graph: &TaskGraph) -> Self {
        Self::from_sorted(graph.sort_by_priority())
    }

    /// Fills the channel with tasks already in dispatch order.
    pub fn from_sorted(tasks: Vec<Task>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let count = tasks.len();
        for task in tasks {
            // The receiver is alive, so this cannot fail
            let _ = sender.send(task);
        }
        drop(sender);

        Self {
            receiver: AsyncMutex::new(receiver),
            remaining: std::sync::atomic::AtomicUsize::new(count),
        }
    }
}

#[async_trait]
impl TaskQueue for PriorityQueue {
    async fn next(&self) -> Option<Dispatch> {
        let task = self.receiver.lock().await.recv().await?;
        self.remaining
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        Some(Dispatch::Run(task))
    }

    async fn complete(&self, _task_id: &str, _succeeded: bool) {}

    fn remaining(&self) -> usize {
        self.remaining.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ReadyState {
    /// Not yet handed out, in priority order.
    pending: Vec<Task>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    running: usize,
}

/// Ready queue gated on dependency completion.
///
/// Dependencies naming tasks outside the graph are treated as satisfied.
pub struct DependencyQueue {
    state: Mutex<ReadyState>,
    /// In-graph dependencies per task.
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    changed: Notify,
}

enum Step {
    Ready(Dispatch),
    Drained,
    Wait,
}

impl DependencyQueue {
    pub fn from_graph(graph: &TaskGraph) -> Self {
        let dependencies = graph
            .task_ids()
            .iter()
            .map(|id| {
                let deps = graph.internal_dependencies_of(id).cloned().collect();
                (id.clone(), deps)
            })
            .collect();

        Self {
            state: Mutex::new(ReadyState {
                pending: graph.sort_by_priority(),
                ..Default::default()
            }),
            dependencies,
            changed: Notify::new(),
        }
    }

    fn deps(&self, task_id: &str) -> &[TaskId] {
        self.dependencies
            .get(task_id)
            .map_or(&[], |deps| deps.as_slice())
    }

    fn step(&self) -> Step {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.pending.is_empty() {
            return Step::Drained;
        }

        // Skips first, so failures propagate before anything else is released
        let skip = state.pending.iter().enumerate().find_map(|(index, task)| {
            self.deps(&task.id)
                .iter()
                .find(|dep| state.failed.contains(dep.as_str()))
                .map(|dep| (index, dep.clone()))
        });
        if let Some((index, failed_dependency)) = skip {
            let task = state.pending.remove(index);
            state.failed.insert(task.id.clone());
            return Step::Ready(Dispatch::Skip {
                task,
                failed_dependency,
            });
        }

        let ready = state.pending.iter().position(|task| {
            self.deps(&task.id)
                .iter()
                .all(|dep| state.completed.contains(dep.as_str()))
        });
        if let Some(index) = ready {
            let task = state.pending.remove(index);
            state.running += 1;
            return Step::Ready(Dispatch::Run(task));
        }

        if state.running == 0 {
            // Only reachable if the graph invariant was broken
            warn!(
                pending = state.pending.len(),
                "No runnable tasks and nothing in flight, draining queue"
            );
            state.pending.clear();
            return Step::Drained;
        }

        Step::Wait
    }
}

#[async_trait]
impl TaskQueue for DependencyQueue {
    async fn next(&self) -> Option<Dispatch> {
        loop {
            // Register interest before inspecting state so no wakeup is lost
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.step() {
                Step::Ready(dispatch) => {
                    if matches!(dispatch, Dispatch::Skip { .. }) {
                        self.changed.notify_waiters();
                    }
                    return Some(dispatch);
                }
                Step::Drained => {
                    self.changed.notify_waiters();
                    return None;
                }
                Step::Wait => notified.await,
            }
        }
    }

    async fn complete(&self, task_id: &str, succeeded: bool) {
        {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.running = state.running.saturating_sub(1);
            if succeeded {
                state.completed.insert(task_id.to_string());
            } else {
                state.failed.insert(task_id.to_string());
            }
        }
        debug!(task_id = task_id, succeeded = succeeded, "Dependency state updated");
        self.changed.notify_waiters();
    }

    fn remaining(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.pending.len(),
            Err(poisoned) => poisoned.into_inner().pending.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn graph(tasks: Vec<Task>) -> TaskGraph {
        TaskGraph::build(tasks).unwrap()
    }

    fn run_id(dispatch: Option<Dispatch>) -> String {
        match dispatch {
            Some(Dispatch::Run(task)) => task.id,
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_priority_queue_order_and_close() {
        let queue = PriorityQueue::from_graph(&graph(vec![
            Task::new("low", "l").with_priority(1),
            Task::new("high", "h").with_priority(9),
            Task::new("mid", "m").with_priority(5),
        ]));

        assert_eq!(queue.remaining(), 3);
        assert_eq!(run_id(queue.next().await), "high");
        assert_eq!(run_id(queue.next().await), "mid");
        assert_eq!(run_id(queue.next().await), "low");
        assert!(queue.next().await.is_none());
        assert_eq!(queue.remaining(), 0);
    }

    #[tokio::test]
    async fn test_priority_queue_ignores_dependencies() {
        let queue = PriorityQueue::from_graph(&graph(vec![
            Task::new("base", "b").with_priority(1),
            Task::new("child", "c").with_priority(2).with_dependencies(["base"]),
        ]));
        assert_eq!(run_id(queue.next().await), "child");
    }

    #[tokio::test]
    async fn test_dependency_queue_releases_after_completion() {
        let queue = Arc::new(DependencyQueue::from_graph(&graph(vec![
            Task::new("base", "b").with_priority(1),
            Task::new("child", "c").with_priority(9).with_dependencies(["base"]),
        ])));

        assert_eq!(run_id(queue.next().await), "base");

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.complete("base", true).await;
        let next = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run_id(next), "child");

        queue.complete("child", true).await;
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dependency_queue_skips_dependents_of_failures() {
        let queue = DependencyQueue::from_graph(&graph(vec![
            Task::new("a", "a"),
            Task::new("b", "b").with_dependencies(["a"]),
            Task::new("c", "c").with_dependencies(["b"]),
            Task::new("d", "d"),
        ]));

        assert_eq!(run_id(queue.next().await), "a");
        assert_eq!(run_id(queue.next().await), "d");
        queue.complete("a", false).await;
        queue.complete("d", true).await;

        match queue.next().await {
            Some(Dispatch::Skip {
                task,
                failed_dependency,
            }) => {
                assert_eq!(task.id, "b");
                assert_eq!(failed_dependency, "a");
            }
            other => panic!("expected skip, got {other:?}"),
        }
        match queue.next().await {
            Some(Dispatch::Skip {
                task,
                failed_dependency,
            }) => {
                assert_eq!(task.id, "c");
                assert_eq!(failed_dependency, "b");
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dependency_queue_treats_external_dependencies_as_met() {
        let queue = DependencyQueue::from_graph(&graph(vec![
            Task::new("a", "a").with_dependencies(["finished-last-run"]),
        ]));
        assert_eq!(run_id(queue.next().await), "a");
    }
}
