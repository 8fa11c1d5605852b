//! Concurrent task scheduling.
//!
//! This module provides the pieces the orchestrator runs a pass with:
//!
//! - **TaskQueue**: pre-populated, closed source of work, either priority
//!   ordered or gated on dependency completion
//! - **WorkerPool**: fixed number of workers draining a queue
//! - **RetryPolicy**: attempt limit and exponential backoff
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Task Graph  │
//!                      └──────┬───────┘
//!                             │ sort_by_priority
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │
//!                      │   (closed)   │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```

pub mod queue;
pub mod retry;
pub mod worker_pool;

pub use queue::{DependencyQueue, Dispatch, PriorityQueue, TaskQueue};
pub use retry::{BackoffCancelled, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
pub use worker_pool::{
    PoolError, PoolStats, WorkOutcome, WorkResult, WorkerPool, WorkerPoolConfig,
    DEFAULT_NUM_WORKERS,
};
