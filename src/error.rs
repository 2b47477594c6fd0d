//! Error types for batch evaluation.
//!
//! Defines the error taxonomy shared across subsystems:
//! - Configuration and task-matrix validation (fatal, the batch never starts)
//! - Result recording (logged, never fatal to the batch)
//! - Scheduler-loop failures (the batch stops early but still summarizes)
//!
//! Per-run execution failures live in [`crate::runner::ExecutorError`] and are
//! always converted into a terminal [`crate::runner::RunResult`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a batch configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Batch configuration must list at least one target")]
    NoTargets,

    #[error("Duplicate target ID: {0}")]
    DuplicateTarget(String),

    #[error("Target '{0}' needs at least one task")]
    EmptyTarget(String),

    #[error("Duplicate task ID '{task_id}' in target '{target_id}'")]
    DuplicateTask { target_id: String, task_id: String },

    #[error("Tasks '{first}' and '{second}' would share result file name '{stem}'")]
    FileNameCollision {
        first: String,
        second: String,
        stem: String,
    },

    #[error("Invalid identifier '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised while persisting run results or the batch summary.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create results directory {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unexpected failures of the scheduler itself.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to scan results in {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Admission ledger error: {0}")]
    Ledger(String),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Concurrency gate closed")]
    GateClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Short machine-readable kind used in the summary's error list.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::Config(_) => "configuration_error",
            BatchError::Scan { .. } => "scan_failure",
            BatchError::Ledger(_) => "ledger_failure",
            BatchError::Worker(_) => "worker_failure",
            BatchError::GateClosed => "gate_closed",
            BatchError::Io(_) => "io_failure",
        }
    }
}
