//! Batch configuration: targets, their tasks, and execution settings.
//!
//! Configurations are loaded from JSON or YAML and validated before any run
//! is dispatched. The task-matrix rules (non-empty targets, unique IDs) are
//! enforced by [`TaskMatrix::expand`](super::matrix::TaskMatrix::expand),
//! which [`BatchConfig::validate`] delegates to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use super::matrix::TaskMatrix;
use crate::error::ConfigError;

/// Timeout applied when neither the task nor the batch sets one.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Step budget handed to the executor when a task does not set one.
pub const DEFAULT_MAX_STEPS: u32 = 50;

const DEFAULT_OUTPUT_DIR: &str = "batch_results";

/// A single task evaluated against a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within its target.
    pub task_id: String,
    /// Instruction handed to the executor.
    pub description: String,
    /// Structured success criteria, opaque to the scheduler.
    #[serde(default)]
    pub success_criteria: Value,
    /// Per-run timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    /// Agent settings overlaid on the batch's global agent config.
    #[serde(default)]
    pub agent_config: Option<Map<String, Value>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl TaskDefinition {
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            success_criteria: Value::Null,
            timeout: None,
            max_steps: None,
            agent_config: None,
            metadata: None,
        }
    }

    /// Sets the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_success_criteria(mut self, criteria: Value) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_agent_config(mut self, config: Map<String, Value>) -> Self {
        self.agent_config = Some(config);
        self
    }
}

/// A target (for example one HTML page) with the tasks evaluated against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroup {
    #[serde(alias = "file_id")]
    pub target_id: String,
    /// Where the executor finds the target, relative to `targets_directory`
    /// unless absolute.
    #[serde(alias = "file_path")]
    pub location: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl TargetGroup {
    pub fn new(target_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            location: location.into(),
            tasks: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }
}

/// Execution settings for a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Dispatch through the worker pool instead of one run at a time.
    pub parallel_execution: bool,
    /// Upper bound on simultaneously in-flight runs in parallel mode.
    pub max_parallel_workers: usize,
    /// Keep admitting runs after a non-successful one.
    pub continue_on_failure: bool,
    /// Fallback per-run timeout in seconds.
    pub global_timeout: Option<f64>,
    #[serde(alias = "num_runs_per_task")]
    pub runs_per_task: u32,
    pub save_individual_results: bool,
    /// Completed runs between progress logs in parallel mode.
    pub progress_log_interval: Option<usize>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            parallel_execution: false,
            max_parallel_workers: 3,
            continue_on_failure: true,
            global_timeout: None,
            runs_per_task: 1,
            save_individual_results: true,
            progress_log_interval: None,
        }
    }
}

impl BatchSettings {
    /// Enables parallel mode with the given worker bound.
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_execution = workers > 1;
        self.max_parallel_workers = workers;
        self
    }

    pub fn with_runs_per_task(mut self, runs: u32) -> Self {
        self.runs_per_task = runs;
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout.as_secs_f64());
        self
    }

    /// Effective worker count: 1 whenever parallel mode is off.
    pub fn worker_count(&self) -> usize {
        if self.parallel_execution {
            self.max_parallel_workers.max(1)
        } else {
            1
        }
    }
}

/// Complete batch evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    /// Base directory that relative target locations resolve against.
    #[serde(default, alias = "html_files_directory")]
    pub targets_directory: Option<PathBuf>,
    #[serde(alias = "html_files")]
    pub targets: Vec<TargetGroup>,
    #[serde(default)]
    pub batch_settings: BatchSettings,
    #[serde(default)]
    pub global_agent_config: Option<Map<String, Value>>,
    #[serde(default, alias = "global_browser_config")]
    pub global_environment_config: Option<Value>,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

impl BatchConfig {
    pub fn new(batch_name: impl Into<String>, targets: Vec<TargetGroup>) -> Self {
        Self {
            batch_name: batch_name.into(),
            description: None,
            output_directory: default_output_directory(),
            targets_directory: None,
            targets,
            batch_settings: BatchSettings::default(),
            global_agent_config: None,
            global_environment_config: None,
        }
    }

    pub fn with_settings(mut self, settings: BatchSettings) -> Self {
        self.batch_settings = settings;
        self
    }

    pub fn with_output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_directory = dir.into();
        self
    }

    pub fn with_global_agent_config(mut self, config: Map<String, Value>) -> Self {
        self.global_agent_config = Some(config);
        self
    }

    /// Validates settings, identifiers and the task matrix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The name only reaches the file system through the sanitized batch ID.
        if self.batch_name.trim().is_empty() {
            return Err(ConfigError::InvalidId {
                id: self.batch_name.clone(),
                reason: "batch_name must not be empty".to_string(),
            });
        }

        let settings = &self.batch_settings;
        if settings.max_parallel_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_parallel_workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if let Some(timeout) = settings.global_timeout {
            validate_timeout("global_timeout", timeout)?;
        }

        for target in &self.targets {
            validate_id("target_id", &target.target_id)?;
            for task in &target.tasks {
                validate_id("task_id", &task.task_id)?;
                if let Some(timeout) = task.timeout {
                    validate_timeout(&format!("{}.{}.timeout", target.target_id, task.task_id), timeout)?;
                }
            }
        }

        TaskMatrix::expand(self).map(|_| ())
    }

    /// Deterministic batch ID so re-running a configuration resumes into
    /// the same directory.
    pub fn batch_id(&self) -> String {
        let digest = Sha256::digest(self.batch_name.as_bytes());
        let hash = hex::encode(&digest[..4]);
        let name: String = self
            .batch_name
            .chars()
            .map(|c| if c == ' ' || c == '/' || c == '\\' { '_' } else { c })
            .collect();
        format!("batch_{}_{}", name, hash)
    }

    /// Directory holding this batch's artifacts.
    pub fn batch_dir(&self) -> PathBuf {
        self.output_directory.join(self.batch_id())
    }

    pub fn total_tasks(&self) -> usize {
        self.targets.iter().map(|t| t.tasks.len()).sum()
    }

    /// Per-run timeout: task setting, then the batch setting, then the default.
    pub fn effective_timeout(&self, task: &TaskDefinition) -> Duration {
        task.timeout
            .or(self.batch_settings.global_timeout)
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
            .unwrap_or(DEFAULT_RUN_TIMEOUT)
    }

    /// Global agent config with the task's overrides applied on top.
    pub fn effective_agent_config(&self, task: &TaskDefinition) -> Map<String, Value> {
        let mut merged = self.global_agent_config.clone().unwrap_or_default();
        if let Some(overrides) = &task.agent_config {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Resolves a target's location against `targets_directory`.
    pub fn resolve_location(&self, target: &TargetGroup) -> String {
        let location = Path::new(&target.location);
        match &self.targets_directory {
            Some(base) if location.is_relative() => base.join(location).to_string_lossy().to_string(),
            _ => target.location.clone(),
        }
    }
}

fn validate_id(key: &str, id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: format!("{} must not be empty", key),
        });
    }
    // IDs become result file names.
    if id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: format!("{} must not contain path separators", key),
        });
    }
    Ok(())
}

fn validate_timeout(key: &str, seconds: f64) -> Result<(), ConfigError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("timeout must be a positive number of seconds, got {}", seconds),
        });
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("timeout of {} seconds is out of range: {}", seconds, e),
    })?;
    Ok(())
}

/// Loads and validates a batch configuration from a JSON or YAML file.
pub fn load_batch_config(path: impl AsRef<Path>) -> Result<BatchConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let config: BatchConfig = match extension(path).as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        "json" => serde_json::from_str(&content)?,
        other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
    };

    config.validate()?;

    info!(
        batch_name = %config.batch_name,
        targets = config.targets.len(),
        tasks = config.total_tasks(),
        runs_per_task = config.batch_settings.runs_per_task,
        "Loaded batch configuration"
    );

    Ok(config)
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// A small two-target configuration used by `init`.
pub fn sample_config() -> BatchConfig {
    let mut login = TaskDefinition::new("valid_login", "Enter valid credentials and click login")
        .with_success_criteria(serde_json::json!(["Login successful"]))
        .with_max_steps(10);
    login.timeout = Some(30.0);

    let mut contact = TaskDefinition::new("fill_form", "Fill out the contact form")
        .with_success_criteria(serde_json::json!(["Form submitted"]))
        .with_max_steps(15);
    contact.timeout = Some(45.0);

    let mut agent = Map::new();
    agent.insert("type".to_string(), Value::String("placeholder".to_string()));

    let mut config = BatchConfig::new(
        "sample_batch_evaluation",
        vec![
            TargetGroup::new("login_page", "login.html").with_task(login),
            TargetGroup::new("contact_form", "contact.html").with_task(contact),
        ],
    )
    .with_settings(BatchSettings {
        max_parallel_workers: 2,
        ..BatchSettings::default()
    })
    .with_global_agent_config(agent);
    config.description = Some("Sample batch evaluation configuration".to_string());
    config.targets_directory = Some(PathBuf::from("targets"));
    config
}

/// Writes [`sample_config`] as YAML or JSON depending on the extension.
/// Paths without an extension get `.json`.
pub fn create_sample_config(path: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
    let mut path = path.as_ref().to_path_buf();
    let config = sample_config();

    let content = match extension(&path).as_str() {
        "yaml" | "yml" => serde_yaml::to_string(&config)?,
        "" => {
            path.set_extension("json");
            serde_json::to_string_pretty(&config)?
        }
        _ => serde_json::to_string_pretty(&config)?,
    };

    std::fs::write(&path, content)?;
    info!(path = %path.display(), "Sample configuration created");
    Ok(path)
}
