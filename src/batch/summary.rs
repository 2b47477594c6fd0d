//! Batch-level statistics computed from task aggregates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate::TaskAggregateResult;
use super::matrix::RunIdentity;
use crate::error::{BatchError, RecordingError};
use crate::runner::{RunResult, RunStatus};

/// Error kind of a failed result or summary write.
pub const RECORDING_FAILURE: &str = "recording_failure";

/// A batch-level error, kept for the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

impl BatchErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&BatchError> for BatchErrorRecord {
    fn from(err: &BatchError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<&RecordingError> for BatchErrorRecord {
    fn from(err: &RecordingError) -> Self {
        Self::new(RECORDING_FAILURE, err.to_string())
    }
}

/// A run that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

/// Run counts by outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
}

impl RunCounters {
    fn add(&mut self, run: &RunResult) {
        self.total += 1;
        if run.is_success() {
            self.successful += 1;
        }
        match run.status {
            RunStatus::Completed => self.completed += 1,
            RunStatus::Failed => self.failed += 1,
            RunStatus::Timeout => self.timeout += 1,
            RunStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Accuracy of one validated field across all runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAccuracy {
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
}

/// Per-target statistics over its tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub target_id: String,
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub average_score: f64,
    pub total_fields: u64,
    pub correct_fields: u64,
    pub field_accuracy: f64,
}

/// The batch summary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub batch_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub runs_per_task: u32,
    pub total_tasks: usize,
    /// Tasks with all configured runs recorded.
    pub completed_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    /// Tasks with some, but not all, runs recorded.
    pub incomplete_tasks: usize,
    pub success_rate: f64,
    pub completion_rate: f64,
    /// Mean over tasks of each task's mean run score.
    pub average_score: f64,
    pub total_fields: u64,
    pub correct_fields: u64,
    pub field_accuracy: f64,
    pub field_accuracy_by_name: BTreeMap<String, FieldAccuracy>,
    pub runs: RunCounters,
    pub status_breakdown: BTreeMap<String, usize>,
    pub total_duration_seconds: f64,
    pub average_duration_seconds: f64,
    pub targets: Vec<TargetStats>,
    pub run_failures: Vec<RunFailure>,
    pub errors: Vec<BatchErrorRecord>,
    /// The batch stopped before every run was admitted.
    pub interrupted: bool,
    pub tasks: Vec<TaskAggregateResult>,
}

impl BatchSummary {
    /// True when the scheduler itself failed, as opposed to a result write.
    pub fn has_batch_failure(&self) -> bool {
        self.errors.iter().any(|e| e.kind != RECORDING_FAILURE)
    }
}

/// Folds task aggregates into a [`BatchSummary`]. No I/O.
#[derive(Debug, Clone)]
pub struct BatchSummarizer {
    batch_id: String,
    batch_name: String,
    total_tasks: usize,
    runs_per_task: u32,
}

impl BatchSummarizer {
    pub fn new(
        batch_id: impl Into<String>,
        batch_name: impl Into<String>,
        total_tasks: usize,
        runs_per_task: u32,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            batch_name: batch_name.into(),
            total_tasks,
            runs_per_task,
        }
    }

    pub fn summarize(
        &self,
        tasks: Vec<TaskAggregateResult>,
        errors: Vec<BatchErrorRecord>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        interrupted: bool,
    ) -> BatchSummary {
        let required_runs = self.runs_per_task as usize;
        let (complete, incomplete): (Vec<&TaskAggregateResult>, Vec<&TaskAggregateResult>) =
            tasks.iter().partition(|t| t.total_runs >= required_runs);

        let completed_tasks = complete.len();
        let successful_tasks = complete.iter().filter(|t| t.task_success).count();
        let incomplete_tasks = incomplete.len();

        let mut runs = RunCounters::default();
        let mut status_breakdown = BTreeMap::new();
        let mut field_accuracy_by_name: BTreeMap<String, FieldAccuracy> = BTreeMap::new();
        let mut run_failures = Vec::new();
        let mut total_duration_seconds = 0.0;
        let mut total_fields = 0u64;
        let mut correct_fields = 0u64;

        let mut targets: Vec<TargetStats> = Vec::new();
        for task in &tasks {
            let index = match targets.iter().position(|t| t.target_id == task.target_id()) {
                Some(index) => index,
                None => {
                    targets.push(TargetStats {
                        target_id: task.target_id().to_string(),
                        ..TargetStats::default()
                    });
                    targets.len() - 1
                }
            };
            let target = &mut targets[index];
            target.total += 1;
            if task.task_success {
                target.successful += 1;
            }
            target.average_score += task.average_score;

            for run in &task.runs {
                runs.add(run);
                *status_breakdown.entry(run.status.to_string()).or_insert(0) += 1;
                total_duration_seconds += run.duration_seconds;

                if run.status != RunStatus::Completed {
                    run_failures.push(RunFailure {
                        identity: run.identity.clone(),
                        status: run.status,
                        error_message: run.error_message.clone(),
                    });
                }

                if let Some(validation) = &run.field_validation {
                    target.total_fields += u64::from(validation.total_fields);
                    target.correct_fields += u64::from(validation.correct_fields);
                    total_fields += u64::from(validation.total_fields);
                    correct_fields += u64::from(validation.correct_fields);
                    for (name, correct) in &validation.fields {
                        let field = field_accuracy_by_name.entry(name.clone()).or_default();
                        field.total += 1;
                        if *correct {
                            field.correct += 1;
                        }
                    }
                }
            }
        }

        for target in &mut targets {
            target.success_rate = ratio(target.successful as f64, target.total as f64);
            target.average_score = ratio(target.average_score, target.total as f64);
            target.field_accuracy = ratio(target.correct_fields as f64, target.total_fields as f64);
        }
        for field in field_accuracy_by_name.values_mut() {
            field.accuracy = ratio(field.correct as f64, field.total as f64);
        }

        let average_score = ratio(
            tasks.iter().map(|t| t.average_score).sum(),
            tasks.len() as f64,
        );

        BatchSummary {
            batch_id: self.batch_id.clone(),
            batch_name: self.batch_name.clone(),
            start_time,
            end_time,
            duration_seconds: (end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0,
            runs_per_task: self.runs_per_task,
            total_tasks: self.total_tasks,
            completed_tasks,
            successful_tasks,
            failed_tasks: completed_tasks - successful_tasks,
            incomplete_tasks,
            success_rate: ratio(successful_tasks as f64, completed_tasks as f64),
            completion_rate: ratio(completed_tasks as f64, self.total_tasks as f64),
            average_score,
            total_fields,
            correct_fields,
            field_accuracy: ratio(correct_fields as f64, total_fields as f64),
            field_accuracy_by_name,
            average_duration_seconds: ratio(total_duration_seconds, runs.total as f64),
            runs,
            status_breakdown,
            total_duration_seconds,
            targets,
            run_failures,
            errors,
            interrupted,
            tasks,
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}
