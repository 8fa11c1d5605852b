//! Project state and its file-based checkpoints.

pub mod checkpoint;
pub mod project;

pub use checkpoint::{is_snapshot_filename, snapshot_filename, CheckpointStore};
pub use project::{merge_file_state, FileState, ProjectState, StateChanges};
