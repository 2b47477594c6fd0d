//! batch-eval: batch execution scheduler for evaluation runs.
//!
//! Expands a batch configuration into targets × tasks × runs, executes the
//! pending runs through a [`runner::RunExecutor`] with bounded concurrency,
//! records each result as it arrives so an interrupted batch resumes where
//! it stopped, and folds repeated runs into majority verdicts.

pub mod batch;
pub mod cli;
pub mod error;
pub mod runner;
pub mod scheduler;

// Re-export commonly used types
pub use batch::{BatchConfig, BatchSummary, RunIdentity};
pub use error::{BatchError, ConfigError, RecordingError};
pub use runner::{RunExecutor, RunResult, RunStatus};
pub use scheduler::BatchScheduler;
