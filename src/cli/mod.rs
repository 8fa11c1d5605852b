//! Command-line interface for devloop.
//!
//! Provides commands for running a project pass, validating task plans,
//! inspecting checkpoints and running one-off sandbox commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
