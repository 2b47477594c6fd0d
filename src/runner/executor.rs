//! The run executor seam and the per-run routine built on it.
//!
//! A [`RunExecutor`] performs one run and reports an [`ExecutionOutcome`].
//! [`execute_run`] wraps every call: it enforces the run's timeout, maps
//! executor errors to terminal statuses and always yields a [`RunResult`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::result::{FieldValidation, RunResult, RunStatus, TaskSuccess};
use crate::batch::config::{BatchConfig, DEFAULT_MAX_STEPS};
use crate::batch::matrix::{MatrixEntry, RunIdentity};

/// Everything an executor needs to perform one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub batch_id: String,
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub total_runs: u32,
    /// Resolved target location.
    pub target_location: String,
    pub task_description: String,
    #[serde(default)]
    pub success_criteria: Value,
    /// Global agent config merged with the task's overrides.
    #[serde(default)]
    pub agent_config: Map<String, Value>,
    #[serde(default)]
    pub environment_config: Option<Value>,
    pub max_steps: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl ExecutionRequest {
    /// Builds the request for one matrix entry.
    pub fn for_entry(config: &BatchConfig, entry: &MatrixEntry<'_>, batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            identity: entry.identity.clone(),
            total_runs: config.batch_settings.runs_per_task,
            target_location: config.resolve_location(entry.target),
            task_description: entry.task.description.clone(),
            success_criteria: entry.task.success_criteria.clone(),
            agent_config: config.effective_agent_config(entry.task),
            environment_config: config.global_environment_config.clone(),
            max_steps: entry.task.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            timeout: config.effective_timeout(entry.task),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// What an executor reports for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOutcome {
    pub task_success: TaskSuccess,
    pub task_score: f64,
    pub steps_taken: Option<u32>,
    pub field_validation: Option<FieldValidation>,
    pub details: Value,
    /// Soft error reported alongside a completed run.
    pub error_message: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(score: f64) -> Self {
        Self {
            task_success: TaskSuccess::True,
            task_score: score,
            ..Self::default()
        }
    }

    pub fn failure(score: f64) -> Self {
        Self {
            task_success: TaskSuccess::False,
            task_score: score,
            ..Self::default()
        }
    }
}

/// Errors an executor may raise.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid executor output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Terminal status a run gets when the executor raises this error.
    pub fn status(&self) -> RunStatus {
        match self {
            ExecutorError::Timeout(_) => RunStatus::Timeout,
            ExecutorError::Cancelled(_) => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

/// Per-run context threaded through every dispatched unit of work.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    /// Batch-wide cancellation signal. Executors may watch it to stop early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Performs one run of one task.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "executor"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        ctx: &RunContext,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Executes one run under its timeout and converts the outcome into a
/// terminal [`RunResult`]. Never fails.
pub async fn execute_run(
    executor: &dyn RunExecutor,
    request: &ExecutionRequest,
    ctx: &RunContext,
) -> RunResult {
    let started_at = Utc::now();
    let start = Instant::now();

    let outcome = tokio::time::timeout(request.timeout, executor.execute(request, ctx)).await;
    let duration = start.elapsed();

    let result = match outcome {
        Ok(Ok(outcome)) => {
            debug!(
                run = %request.identity,
                task_success = ?outcome.task_success,
                score = outcome.task_score,
                "Executor finished"
            );
            RunResult::completed(
                request.identity.clone(),
                outcome.task_success,
                outcome.task_score,
                started_at,
                duration,
            )
            .with_error(outcome.error_message)
            .with_steps(outcome.steps_taken)
            .with_field_validation(outcome.field_validation)
            .with_details(outcome.details)
        }
        Ok(Err(e)) => {
            warn!(run = %request.identity, executor = executor.name(), error = %e, "Run failed");
            RunResult::unsuccessful(request.identity.clone(), e.status(), started_at, duration, e.to_string())
        }
        Err(_) => {
            warn!(run = %request.identity, timeout = ?request.timeout, "Run timed out");
            RunResult::unsuccessful(
                request.identity.clone(),
                RunStatus::Timeout,
                started_at,
                duration,
                format!("Run timed out after {:.1}s", request.timeout.as_secs_f64()),
            )
        }
    };

    result
        .with_batch(&request.batch_id, request.total_runs)
        .with_task_context(&request.target_location, &request.task_description)
}
