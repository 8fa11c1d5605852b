//! Task graph: tasks as nodes, depends-on relations as edges.
//!
//! Pure data with no I/O. Construction validates id uniqueness and
//! acyclicity; a graph that fails either check is never returned.
//!
//! # Example
//!
//! ```
//! use devloop::graph::{Task, TaskGraph};
//!
//! let graph = TaskGraph::build(vec![
//!     Task::new("schema", "Create the database schema").with_priority(2),
//!     Task::new("api", "Expose the REST API")
//!         .with_priority(1)
//!         .with_dependencies(["schema"]),
//! ])
//! .unwrap();
//!
//! let order: Vec<_> = graph.sort_by_priority().into_iter().map(|t| t.id).collect();
//! assert_eq!(order, vec!["schema", "api"]);
//! ```

pub mod builder;
pub mod task;

pub use builder::TaskGraph;
pub use task::{Task, TaskId, DEFAULT_ENVIRONMENT};
