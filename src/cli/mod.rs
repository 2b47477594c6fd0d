//! Command-line interface for batch-eval.
//!
//! Provides commands for running and resuming batches, inspecting their
//! progress and writing a sample configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
