//! Folding repeated runs of a task into one task-level verdict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::matrix::TaskKey;
use crate::runner::RunResult;

/// All recorded runs of one task, folded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAggregateResult {
    #[serde(flatten)]
    pub key: TaskKey,
    /// Runs actually recorded, never padded to the configured count.
    pub total_runs: usize,
    pub successful_runs: usize,
    /// `total_runs - successful_runs`; unknown verdicts count as failed.
    pub failed_runs: usize,
    pub success_rate_across_runs: f64,
    /// Strict majority of successful runs.
    pub task_success: bool,
    /// Mean partial-credit score across runs.
    pub average_score: f64,
    /// Most recent run, shown in reports.
    pub representative: RunResult,
    /// Contributing runs, by run number.
    pub runs: Vec<RunResult>,
}

impl TaskAggregateResult {
    /// Folds the runs of one task. Returns `None` when there are none.
    pub fn from_runs(key: TaskKey, mut runs: Vec<RunResult>) -> Option<Self> {
        runs.sort_by(|a, b| {
            a.identity
                .run_number
                .cmp(&b.identity.run_number)
                .then(a.ended_at.cmp(&b.ended_at))
        });
        let representative = runs.iter().max_by_key(|r| r.ended_at)?.clone();

        let total_runs = runs.len();
        let successful_runs = runs.iter().filter(|r| r.is_success()).count();
        let failed_runs = total_runs - successful_runs;
        let average_score = runs.iter().map(|r| r.task_score).sum::<f64>() / total_runs as f64;

        Some(Self {
            key,
            total_runs,
            successful_runs,
            failed_runs,
            success_rate_across_runs: successful_runs as f64 / total_runs as f64,
            task_success: successful_runs > failed_runs,
            average_score,
            representative,
            runs,
        })
    }

    pub fn target_id(&self) -> &str {
        &self.key.target_id
    }
}

/// Groups run results by task and folds each group.
#[derive(Debug, Default)]
pub struct MultiRunAggregator {
    groups: HashMap<TaskKey, Vec<RunResult>>,
    runs_per_task: Option<u32>,
}

impl MultiRunAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignores runs numbered above `runs_per_task`, for example results left
    /// behind by an earlier configuration with more runs per task.
    pub fn with_runs_per_task(mut self, runs_per_task: u32) -> Self {
        self.runs_per_task = Some(runs_per_task);
        self
    }

    pub fn add(&mut self, result: RunResult) {
        if self
            .runs_per_task
            .is_some_and(|limit| result.identity.run_number > limit)
        {
            return;
        }
        self.groups
            .entry(result.identity.task_key())
            .or_default()
            .push(result);
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = RunResult>) {
        for result in results {
            self.add(result);
        }
    }

    /// Aggregates in `task_order`. Tasks without runs are left out; results
    /// for tasks not in `task_order` are ignored.
    pub fn finish(mut self, task_order: &[TaskKey]) -> Vec<TaskAggregateResult> {
        task_order
            .iter()
            .filter_map(|key| {
                let runs = self.groups.remove(key)?;
                TaskAggregateResult::from_runs(key.clone(), runs)
            })
            .collect()
    }
}
