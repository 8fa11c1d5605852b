//! Bounded worker pool draining a [`TaskQueue`].
//!
//! A fixed number of workers pull from a shared, pre-populated queue until it
//! is drained. Outcomes are collected rather than failing fast: every worker
//! runs to completion before the pool returns.
//!
//! # Features
//!
//! - Fixed pool size (default 5)
//! - Graceful drain on cancellation: no new work is dequeued once the token
//!   fires, work in flight is left to observe the token itself
//! - Pool statistics tracking

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::queue::{Dispatch, TaskQueue};
use crate::graph::{Task, TaskId};

/// Default number of concurrent workers.
pub const DEFAULT_NUM_WORKERS: usize = 5;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was configured with no workers.
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    /// A worker task panicked or was aborted.
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing tasks.
    pub active_workers: usize,
    /// Total number of tasks completed successfully.
    pub tasks_completed: u64,
    /// Total number of tasks that failed.
    pub tasks_failed: u64,
    /// Tasks handed out as skipped.
    pub tasks_skipped: u64,
    /// Average task processing duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_skipped: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_skip(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_tasks = completed + failed;
        let average_duration = if total_tasks > 0 {
            Duration::from_millis(total_duration_ms / total_tasks)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_skipped: self.tasks_skipped.load(Ordering::SeqCst),
            average_task_duration: average_duration,
        }
    }
}

/// Result of one unit of work.
#[derive(Debug)]
pub enum WorkResult<T, E> {
    Completed(T),
    Failed(E),
    Skipped { failed_dependency: TaskId },
}

/// One task's outcome, tagged with the worker that handled it.
#[derive(Debug)]
pub struct WorkOutcome<T, E> {
    pub task_id: TaskId,
    pub worker_id: String,
    pub result: WorkResult<T, E>,
    pub duration: Duration,
}

/// Pool of workers that drain a queue with a shared handler.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoWorkers` if `num_workers` is zero.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        Ok(Self {
            config,
            stats: Arc::new(SharedPoolStats::default()),
        })
    }

    /// Runs workers until `queue` is drained or `cancel` fires.
    ///
    /// Every task handed out is reported back to the queue with its outcome,
    /// so dependency-gated queues can release or skip dependents.
    pub async fn run<Q, H, Fut, T, E>(
        &self,
        queue: Arc<Q>,
        cancel: CancellationToken,
        handler: H,
    ) -> Result<Vec<WorkOutcome<T, E>>, PoolError>
    where
        Q: TaskQueue + ?Sized + 'static,
        H: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut workers = JoinSet::new();

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&queue),
                handler: Arc::clone(&handler),
                cancel: cancel.clone(),
                stats: Arc::clone(&self.stats),
            };
            workers.spawn(worker.run());
        }

        info!(num_workers = self.config.num_workers, "Worker pool started");

        let mut outcomes = Vec::new();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(mut worker_outcomes) => outcomes.append(&mut worker_outcomes),
                Err(e) => {
                    error!(error = %e, "Worker task panicked");
                    failure.get_or_insert(PoolError::WorkerFailed(e.to_string()));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let stats = self.stats();
        info!(
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            skipped = stats.tasks_skipped,
            "Worker pool drained"
        );
        Ok(outcomes)
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker pulling from the shared queue.
struct Worker<Q: ?Sized, H> {
    id: String,
    queue: Arc<Q>,
    handler: Arc<H>,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
}

impl<Q, H, Fut, T, E> Worker<Q, H>
where
    Q: TaskQueue + ?Sized,
    H: Fn(Task) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    /// Main worker loop.
    async fn run(self) -> Vec<WorkOutcome<T, E>> {
        debug!(worker_id = %self.id, "Worker started");
        let mut outcomes = Vec::new();

        loop {
            let dispatch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(worker_id = %self.id, "Worker received cancellation");
                    break;
                }
                next = self.queue.next() => next,
            };

            let Some(dispatch) = dispatch else {
                break;
            };

            outcomes.push(self.process(dispatch).await);
        }

        debug!(worker_id = %self.id, processed = outcomes.len(), "Worker stopped");
        outcomes
    }

    async fn process(&self, dispatch: Dispatch) -> WorkOutcome<T, E> {
        match dispatch {
            Dispatch::Skip {
                task,
                failed_dependency,
            } => {
                info!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    dependency = %failed_dependency,
                    "Skipping task with failed dependency"
                );
                self.stats.record_skip();
                WorkOutcome {
                    task_id: task.id,
                    worker_id: self.id.clone(),
                    result: WorkResult::Skipped { failed_dependency },
                    duration: Duration::ZERO,
                }
            }
            Dispatch::Run(task) => {
                let task_id = task.id.clone();
                let started = Instant::now();
                self.stats.increment_active();
                debug!(worker_id = %self.id, task_id = %task_id, "Processing task");

                let result = AssertUnwindSafe(async { (self.handler)(task).await })
                    .catch_unwind()
                    .await;

                let duration = started.elapsed();
                self.stats.decrement_active();
                let result = match result {
                    Ok(result) => result,
                    Err(panic) => {
                        // Release dependents before the worker goes down
                        self.stats.record_failure(duration);
                        self.queue.complete(&task_id, false).await;
                        error!(worker_id = %self.id, task_id = %task_id, "Task handler panicked");
                        std::panic::resume_unwind(panic);
                    }
                };
                let succeeded = result.is_ok();
                if succeeded {
                    self.stats.record_completion(duration);
                } else {
                    self.stats.record_failure(duration);
                }
                self.queue.complete(&task_id, succeeded).await;

                WorkOutcome {
                    task_id,
                    worker_id: self.id.clone(),
                    result: match result {
                        Ok(value) => WorkResult::Completed(value),
                        Err(e) => WorkResult::Failed(e),
                    },
                    duration,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskGraph;
    use crate::scheduler::queue::{DependencyQueue, PriorityQueue};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn tasks(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| Task::new(format!("t{i}"), "work").with_priority((n - i) as i32))
            .collect()
    }

    #[test]
    fn test_worker_pool_config_default() {
        assert_eq!(WorkerPoolConfig::default().num_workers, 5);
        assert_eq!(WorkerPoolConfig::new(2).num_workers, 2);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::new(WorkerPoolConfig::new(0)),
            Err(PoolError::NoWorkers)
        ));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            tasks_skipped: 0,
            average_task_duration: Duration::from_secs(10),
        };
        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < 0.001);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_pool_collects_all_outcomes() {
        let graph = TaskGraph::build(tasks(6)).unwrap();
        let queue = Arc::new(PriorityQueue::from_graph(&graph));
        let pool = WorkerPool::new(WorkerPoolConfig::new(3)).unwrap();

        let outcomes = pool
            .run(queue, CancellationToken::new(), |task: Task| async move {
                if task.id == "t2" {
                    Err(format!("{} failed", task.id))
                } else {
                    Ok(task.id.len())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 6);
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o.result, WorkResult::Failed(_)))
            .map(|o| o.task_id.as_str())
            .collect();
        assert_eq!(failed, vec!["t2"]);

        let stats = pool.stats();
        assert_eq!(stats.tasks_completed, 5);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.active_workers, 0);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_worker_count() {
        let graph = TaskGraph::build(tasks(12)).unwrap();
        let queue = Arc::new(PriorityQueue::from_graph(&graph));
        let pool = WorkerPool::new(WorkerPoolConfig::new(3)).unwrap();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        pool.run(queue, CancellationToken::new(), move |_task: Task| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ()>(())
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_single_worker_follows_priority_order() {
        let graph = TaskGraph::build(vec![
            Task::new("p3", "x").with_priority(3),
            Task::new("p1", "y").with_priority(1),
            Task::new("p2", "z").with_priority(2),
        ])
        .unwrap();
        let queue = Arc::new(PriorityQueue::from_graph(&graph));
        let pool = WorkerPool::new(WorkerPoolConfig::new(1)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        pool.run(queue, CancellationToken::new(), move |task: Task| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().unwrap().push(task.id);
                Ok::<_, ()>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["p3", "p2", "p1"]);
    }

    #[tokio::test]
    async fn test_cancelled_pool_stops_dequeuing() {
        let graph = TaskGraph::build(tasks(10)).unwrap();
        let queue = Arc::new(PriorityQueue::from_graph(&graph));
        let pool = WorkerPool::new(WorkerPoolConfig::new(1)).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let outcomes = pool
            .run(Arc::clone(&queue), cancel, move |task: Task| {
                let trigger = trigger.clone();
                async move {
                    if task.id == "t1" {
                        trigger.cancel();
                    }
                    Ok::<_, ()>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(queue.remaining(), 8);
    }

    #[tokio::test]
    async fn test_dependency_queue_skips_are_reported() {
        let graph = TaskGraph::build(vec![
            Task::new("a", "a"),
            Task::new("b", "b").with_dependencies(["a"]),
            Task::new("c", "c"),
        ])
        .unwrap();
        let queue = Arc::new(DependencyQueue::from_graph(&graph));
        let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();

        let outcomes = pool
            .run(queue, CancellationToken::new(), |task: Task| async move {
                if task.id == "a" {
                    Err("boom")
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        let skipped = outcomes
            .iter()
            .find(|o| o.task_id == "b")
            .map(|o| &o.result)
            .unwrap();
        assert!(matches!(
            skipped,
            WorkResult::Skipped { failed_dependency } if failed_dependency == "a"
        ));
        assert_eq!(pool.stats().tasks_skipped, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_releases_waiting_workers() {
        let graph = TaskGraph::build(vec![
            Task::new("a", "a"),
            Task::new("b", "b").with_dependencies(["a"]),
        ])
        .unwrap();
        let queue = Arc::new(DependencyQueue::from_graph(&graph));
        let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pool.run(Arc::clone(&queue), CancellationToken::new(), |task: Task| async move {
                if task.id == "a" {
                    panic!("handler blew up on {}", task.id);
                }
                Ok::<_, ()>(())
            }),
        )
        .await
        .expect("pool hung after a handler panic");

        assert!(matches!(result, Err(PoolError::WorkerFailed(_))));
        assert_eq!(queue.remaining(), 0);
        assert_eq!(pool.stats().tasks_failed, 1);
        assert_eq!(pool.stats().active_workers, 0);
    }
}
