//! Results of individual runs.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::batch::matrix::RunIdentity;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The executor finished; check `task_success` for the verdict.
    Completed,
    /// The executor raised an error.
    Failed,
    /// The run exceeded its timeout.
    Timeout,
    /// The run was cancelled by the executor or the user.
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Validator verdict for a run. Serialized as `true`, `false` or `null`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum TaskSuccess {
    True,
    False,
    #[default]
    Unknown,
}

impl TaskSuccess {
    pub fn is_true(self) -> bool {
        self == TaskSuccess::True
    }
}

impl From<Option<bool>> for TaskSuccess {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => TaskSuccess::True,
            Some(false) => TaskSuccess::False,
            None => TaskSuccess::Unknown,
        }
    }
}

impl From<TaskSuccess> for Option<bool> {
    fn from(value: TaskSuccess) -> Self {
        match value {
            TaskSuccess::True => Some(true),
            TaskSuccess::False => Some(false),
            TaskSuccess::Unknown => None,
        }
    }
}

impl From<bool> for TaskSuccess {
    fn from(value: bool) -> Self {
        Some(value).into()
    }
}

/// Field-level detail reported by a validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    pub total_fields: u32,
    pub correct_fields: u32,
    /// Per-field verdicts keyed by field name.
    #[serde(default)]
    pub fields: BTreeMap<String, bool>,
}

impl FieldValidation {
    pub fn accuracy(&self) -> f64 {
        if self.total_fields == 0 {
            return 0.0;
        }
        self.correct_fields as f64 / self.total_fields as f64
    }
}

/// Result of one run. Created once, never mutated, persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub run_id: String,
    #[serde(flatten)]
    pub identity: RunIdentity,
    /// Configured runs per task at the time the run was recorded.
    #[serde(default = "default_total_runs")]
    pub total_runs: u32,
    #[serde(default)]
    pub batch_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub task_success: TaskSuccess,
    /// Partial credit in `[0.0, 1.0]`.
    #[serde(default)]
    pub task_score: f64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub started_at: DateTime<Utc>,
    /// Completion time.
    #[serde(rename = "timestamp", default, deserialize_with = "deserialize_timestamp")]
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub target_location: String,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub steps_taken: Option<u32>,
    #[serde(default)]
    pub field_validation: Option<FieldValidation>,
    /// Free-form executor output.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

fn default_total_runs() -> u32 {
    1
}

/// Parses RFC 3339, or a naive ISO 8601 timestamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

// Older result files carry timestamps without an offset.
fn deserialize_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(DateTime::<Utc>::default()),
        Some(raw) => parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw))),
    }
}

impl RunResult {
    fn base(identity: RunIdentity, status: RunStatus, started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            run_id: format!("run-{}", Uuid::new_v4()),
            identity,
            total_runs: 1,
            batch_id: String::new(),
            status,
            task_success: TaskSuccess::Unknown,
            task_score: 0.0,
            duration_seconds: duration.as_secs_f64(),
            started_at,
            ended_at: started_at + chrono::Duration::from_std(duration).unwrap_or_default(),
            error_message: None,
            target_location: String::new(),
            task_description: String::new(),
            steps_taken: None,
            field_validation: None,
            details: Value::Null,
        }
    }

    /// A run the executor finished. The score is clamped to `[0, 1]`.
    pub fn completed(
        identity: RunIdentity,
        task_success: TaskSuccess,
        task_score: f64,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let mut result = Self::base(identity, RunStatus::Completed, started_at, duration);
        result.task_success = task_success;
        result.task_score = clamp_score(task_score);
        result
    }

    /// A run that ended without a verdict: failed, timed out or cancelled.
    pub fn unsuccessful(
        identity: RunIdentity,
        status: RunStatus,
        started_at: DateTime<Utc>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(identity, status, started_at, duration);
        result.task_success = TaskSuccess::False;
        result.error_message = Some(error.into());
        result
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>, total_runs: u32) -> Self {
        self.batch_id = batch_id.into();
        self.total_runs = total_runs;
        self
    }

    pub fn with_task_context(mut self, target_location: impl Into<String>, task_description: impl Into<String>) -> Self {
        self.target_location = target_location.into();
        self.task_description = task_description.into();
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error_message = error;
        self
    }

    pub fn with_steps(mut self, steps: Option<u32>) -> Self {
        self.steps_taken = steps;
        self
    }

    pub fn with_field_validation(mut self, validation: Option<FieldValidation>) -> Self {
        self.field_validation = validation;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// True when the validator judged the task accomplished.
    pub fn is_success(&self) -> bool {
        self.task_success.is_true()
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
