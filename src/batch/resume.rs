//! Resume support: reconstructs batch progress from recorded result files.
//!
//! Every recorded run is its own resumption point, so no checkpoint file is
//! needed. The index prefers the identity embedded in a result payload and
//! falls back to parsing the file name (`<target>_<task>[_run<N>]`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::matrix::{RunIdentity, TaskKey};
use crate::error::BatchError;
use crate::runner::RunResult;

/// Counts shown when a batch resumes and by the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub total_tasks: usize,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub remaining_runs: usize,
    pub completion_percentage: f64,
}

/// Index of the runs already recorded in a results directory.
#[derive(Debug, Clone, Default)]
pub struct ResumeIndex {
    results_dir: PathBuf,
    runs: BTreeMap<RunIdentity, RunResult>,
    /// Results recorded before run numbering existed.
    unnumbered: BTreeMap<TaskKey, Vec<RunResult>>,
    corrupt_files: usize,
}

impl ResumeIndex {
    /// An index with nothing recorded.
    pub fn empty(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            ..Self::default()
        }
    }

    /// Scans `results_dir` for `*.json` result files.
    ///
    /// A missing directory yields an empty index. Unreadable or corrupt
    /// files are logged and skipped; they never count as done.
    pub async fn scan(results_dir: impl Into<PathBuf>) -> Result<Self, BatchError> {
        let mut index = Self::empty(results_dir);
        if !tokio::fs::try_exists(&index.results_dir).await.unwrap_or(false) {
            info!(dir = %index.results_dir.display(), "No results directory found, starting fresh");
            return Ok(index);
        }

        let mut entries = tokio::fs::read_dir(&index.results_dir)
            .await
            .map_err(|source| BatchError::Scan {
                path: index.results_dir.clone(),
                source,
            })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| BatchError::Scan {
            path: index.results_dir.clone(),
            source,
        })? {
            let path = entry.path();
            if is_result_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            index.load_file(&path).await;
        }

        info!(
            dir = %index.results_dir.display(),
            recorded = index.len(),
            corrupt = index.corrupt_files,
            "Scanned recorded results"
        );
        Ok(index)
    }

    /// Loads one file into the index. Returns false when it could not be used.
    async fn load_file(&mut self, path: &Path) -> bool {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read result file");
                self.corrupt_files += 1;
                return false;
            }
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        match parse_record(&stem, &content) {
            Ok(ParsedRecord { result, numbered: true }) => {
                debug!(run = %result.identity, file = %stem, "Found recorded run");
                self.runs.insert(result.identity.clone(), result);
                true
            }
            Ok(ParsedRecord { result, numbered: false }) => {
                debug!(task = %result.identity.task_key(), file = %stem, "Found unnumbered result");
                self.unnumbered
                    .entry(result.identity.task_key())
                    .or_default()
                    .push(result);
                true
            }
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "Skipping corrupt result file");
                self.corrupt_files += 1;
                false
            }
        }
    }

    /// Looks for a result recorded for `identity` since the scan (by this or
    /// another process), then answers [`should_skip`](Self::should_skip).
    pub async fn refresh(&mut self, identity: &RunIdentity, runs_per_task: u32) -> bool {
        if !self.runs.contains_key(identity) {
            let path = self
                .results_dir
                .join(format!("{}.json", identity.file_stem(runs_per_task)));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                self.load_file(&path).await;
            }
        }
        self.should_skip(identity, runs_per_task)
    }

    /// True when `identity` already has a result, or its task already has
    /// at least `runs_per_task` results.
    pub fn should_skip(&self, identity: &RunIdentity, runs_per_task: u32) -> bool {
        if self.runs.contains_key(identity) {
            return true;
        }
        self.task_run_count(&identity.task_key()) >= runs_per_task as usize
    }

    /// Adds a result produced during this batch.
    pub fn insert(&mut self, result: RunResult) {
        self.runs.insert(result.identity.clone(), result);
    }

    pub fn contains(&self, identity: &RunIdentity) -> bool {
        self.runs.contains_key(identity)
    }

    pub fn get(&self, identity: &RunIdentity) -> Option<&RunResult> {
        self.runs.get(identity)
    }

    /// Number of recorded results for a task, numbered or not.
    pub fn task_run_count(&self, key: &TaskKey) -> usize {
        let numbered = self.runs.keys().filter(|id| id.belongs_to(key)).count();
        numbered + self.unnumbered.get(key).map_or(0, Vec::len)
    }

    /// Every recorded result for a task: unnumbered first, then by run number.
    pub fn results_for(&self, key: &TaskKey) -> Vec<&RunResult> {
        let mut results: Vec<&RunResult> = self.unnumbered.get(key).into_iter().flatten().collect();
        results.extend(
            self.runs
                .iter()
                .filter(|(id, _)| id.belongs_to(key))
                .map(|(_, result)| result),
        );
        results
    }

    /// Identities with a numbered result, in order.
    pub fn identities(&self) -> impl Iterator<Item = &RunIdentity> {
        self.runs.keys()
    }

    pub fn results(&self) -> impl Iterator<Item = &RunResult> {
        self.unnumbered.values().flatten().chain(self.runs.values())
    }

    pub fn len(&self) -> usize {
        self.runs.len() + self.unnumbered.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn corrupt_files(&self) -> usize {
        self.corrupt_files
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn summary(&self, total_tasks: usize, runs_per_task: u32) -> ResumeSummary {
        let total_runs = total_tasks * runs_per_task as usize;
        let completed_runs = self.len();
        let successful_runs = self.results().filter(|r| r.is_success()).count();
        ResumeSummary {
            total_tasks,
            total_runs,
            completed_runs,
            successful_runs,
            failed_runs: completed_runs - successful_runs,
            remaining_runs: total_runs.saturating_sub(completed_runs),
            completion_percentage: if total_runs > 0 {
                (completed_runs as f64 / total_runs as f64 * 100.0).min(100.0)
            } else {
                0.0
            },
        }
    }
}

struct ParsedRecord {
    result: RunResult,
    numbered: bool,
}

fn is_result_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().is_some_and(|e| e == "json")
}

fn run_suffix() -> Option<&'static Regex> {
    static RUN_SUFFIX: OnceLock<Option<Regex>> = OnceLock::new();
    RUN_SUFFIX
        .get_or_init(|| Regex::new(r"^(?P<base>.+)_run(?P<run>\d+)$").ok())
        .as_ref()
}

/// Splits `<base>_run<N>` into `(base, Some(N))`.
fn split_run_suffix(stem: &str) -> (&str, Option<u32>) {
    let captures = run_suffix().and_then(|re| re.captures(stem));
    match captures {
        Some(caps) => {
            let run = caps.name("run").and_then(|m| m.as_str().parse().ok());
            let base = caps.name("base").map_or(stem, |m| m.as_str());
            match run {
                Some(run) => (base, Some(run)),
                None => (stem, None),
            }
        }
        None => (stem, None),
    }
}

fn parse_record(stem: &str, content: &str) -> Result<ParsedRecord, String> {
    let mut value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| "result is not a JSON object".to_string())?;

    // Older results name the target `html_file_id`.
    if !object.contains_key("target_id") {
        if let Some(legacy) = object.remove("html_file_id") {
            object.insert("target_id".to_string(), legacy);
        }
    }

    let (base, file_run) = split_run_suffix(stem);

    let has_ids = object.get("target_id").is_some_and(Value::is_string)
        && object.get("task_id").is_some_and(Value::is_string);
    if !has_ids {
        let (target_id, task_id) = base
            .rsplit_once('_')
            .filter(|(target, task)| !target.is_empty() && !task.is_empty())
            .ok_or_else(|| format!("cannot derive identity from file name '{}'", stem))?;
        object.insert("target_id".to_string(), Value::from(target_id));
        object.insert("task_id".to_string(), Value::from(task_id));
    }

    let numbered = match object.get("run_number").and_then(Value::as_u64) {
        Some(n) if n >= 1 => true,
        _ => {
            object.insert("run_number".to_string(), Value::from(file_run.unwrap_or(1)));
            file_run.is_some()
        }
    };

    let result: RunResult = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(ParsedRecord { result, numbered })
}

/// Removes stale `*_checkpoint.json` files left by older versions.
/// Returns how many were removed; failures are logged and ignored.
pub async fn clean_legacy_checkpoints(batch_dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(batch_dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_checkpoint = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with("_checkpoint.json"));
        if !is_checkpoint {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed old checkpoint file");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove checkpoint file"),
        }
    }

    if removed > 0 {
        info!(removed, "Cleaned up old checkpoint files");
    }
    removed
}
