//! Task matrix expansion.
//!
//! Turns a validated [`BatchConfig`] into the flat, ordered list of
//! [`RunIdentity`] values the scheduler dispatches: target order, then task
//! order within the target, then run number `1..=runs_per_task`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::{BatchConfig, TargetGroup, TaskDefinition};
use crate::error::ConfigError;

/// Identifies one task within a batch: `(target_id, task_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub target_id: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(target_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            task_id: task_id.into(),
        }
    }

    /// Base file stem for this task's result artifacts.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.target_id, self.task_id)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_id, self.task_id)
    }
}

/// Unique key of one run across the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunIdentity {
    pub target_id: String,
    pub task_id: String,
    /// 1-based run number, at most `runs_per_task`.
    pub run_number: u32,
}

impl RunIdentity {
    pub fn new(target_id: impl Into<String>, task_id: impl Into<String>, run_number: u32) -> Self {
        Self {
            target_id: target_id.into(),
            task_id: task_id.into(),
            run_number,
        }
    }

    pub fn task_key(&self) -> TaskKey {
        TaskKey::new(&self.target_id, &self.task_id)
    }

    pub fn belongs_to(&self, key: &TaskKey) -> bool {
        self.target_id == key.target_id && self.task_id == key.task_id
    }

    /// Result file stem: `<target>_<task>` for single-run batches,
    /// `<target>_<task>_run<N>` otherwise so repeated runs never overwrite.
    pub fn file_stem(&self, runs_per_task: u32) -> String {
        if runs_per_task > 1 {
            format!("{}_{}_run{}", self.target_id, self.task_id, self.run_number)
        } else {
            format!("{}_{}", self.target_id, self.task_id)
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.target_id, self.task_id, self.run_number)
    }
}

/// One dispatchable entry of the matrix.
#[derive(Debug, Clone)]
pub struct MatrixEntry<'a> {
    pub identity: RunIdentity,
    pub target: &'a TargetGroup,
    pub task: &'a TaskDefinition,
}

/// The expanded task matrix of a batch.
#[derive(Debug)]
pub struct TaskMatrix<'a> {
    entries: Vec<MatrixEntry<'a>>,
    total_tasks: usize,
    runs_per_task: u32,
}

impl<'a> TaskMatrix<'a> {
    /// Expands a configuration into run identities.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a target has no tasks, a task ID repeats
    /// within a target, a target ID repeats, two tasks map to the same
    /// result file name, or `runs_per_task` is zero.
    pub fn expand(config: &'a BatchConfig) -> Result<Self, ConfigError> {
        let runs_per_task = config.batch_settings.runs_per_task;
        if runs_per_task == 0 {
            return Err(ConfigError::InvalidValue {
                key: "runs_per_task".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if config.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut target_ids = HashSet::new();
        let mut stems: HashMap<String, TaskKey> = HashMap::new();
        let mut entries = Vec::new();
        let mut total_tasks = 0;

        for target in &config.targets {
            if !target_ids.insert(target.target_id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.target_id.clone()));
            }
            if target.tasks.is_empty() {
                return Err(ConfigError::EmptyTarget(target.target_id.clone()));
            }

            let mut task_ids = HashSet::new();
            for task in &target.tasks {
                if !task_ids.insert(task.task_id.as_str()) {
                    return Err(ConfigError::DuplicateTask {
                        target_id: target.target_id.clone(),
                        task_id: task.task_id.clone(),
                    });
                }
                // `a_b` + `c` and `a` + `b_c` both name `a_b_c.json`.
                let key = TaskKey::new(&target.target_id, &task.task_id);
                let stem = key.file_stem();
                if let Some(existing) = stems.get(&stem) {
                    return Err(ConfigError::FileNameCollision {
                        first: existing.to_string(),
                        second: key.to_string(),
                        stem,
                    });
                }
                stems.insert(stem, key);
                total_tasks += 1;

                for run_number in 1..=runs_per_task {
                    entries.push(MatrixEntry {
                        identity: RunIdentity::new(&target.target_id, &task.task_id, run_number),
                        target,
                        task,
                    });
                }
            }
        }

        Ok(Self {
            entries,
            total_tasks,
            runs_per_task,
        })
    }

    pub fn entries(&self) -> &[MatrixEntry<'a>] {
        &self.entries
    }

    pub fn identities(&self) -> impl Iterator<Item = &RunIdentity> {
        self.entries.iter().map(|e| &e.identity)
    }

    /// Task keys in matrix order, one per task.
    pub fn task_keys(&self) -> Vec<TaskKey> {
        self.entries
            .iter()
            .filter(|e| e.identity.run_number == 1)
            .map(|e| e.identity.task_key())
            .collect()
    }

    pub fn total_tasks(&self) -> usize {
        self.total_tasks
    }

    pub fn total_runs(&self) -> usize {
        self.entries.len()
    }

    pub fn runs_per_task(&self) -> u32 {
        self.runs_per_task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::config::{BatchSettings, TargetGroup, TaskDefinition};

    fn config(targets: Vec<TargetGroup>, runs: u32) -> BatchConfig {
        BatchConfig::new("matrix-test", targets)
            .with_settings(BatchSettings::default().with_runs_per_task(runs))
    }

    #[test]
    fn test_expand_orders_target_task_run() {
        let cfg = config(
            vec![
                TargetGroup::new("a", "a.html")
                    .with_task(TaskDefinition::new("t1", "first"))
                    .with_task(TaskDefinition::new("t2", "second")),
                TargetGroup::new("b", "b.html").with_task(TaskDefinition::new("t1", "third")),
            ],
            2,
        );
        let matrix = TaskMatrix::expand(&cfg).unwrap();

        let ids: Vec<String> = matrix.identities().map(|i| i.to_string()).collect();
        assert_eq!(
            ids,
            vec!["a:t1#1", "a:t1#2", "a:t2#1", "a:t2#2", "b:t1#1", "b:t1#2"]
        );
        assert_eq!(matrix.total_tasks(), 3);
        assert_eq!(matrix.total_runs(), 6);
        assert_eq!(matrix.task_keys().len(), 3);
    }

    #[test]
    fn test_expand_rejects_empty_target() {
        let cfg = config(vec![TargetGroup::new("a", "a.html")], 1);
        assert!(matches!(
            TaskMatrix::expand(&cfg),
            Err(ConfigError::EmptyTarget(id)) if id == "a"
        ));
    }

    #[test]
    fn test_expand_rejects_duplicates() {
        let cfg = config(
            vec![TargetGroup::new("a", "a.html")
                .with_task(TaskDefinition::new("t1", "x"))
                .with_task(TaskDefinition::new("t1", "y"))],
            1,
        );
        assert!(matches!(
            TaskMatrix::expand(&cfg),
            Err(ConfigError::DuplicateTask { .. })
        ));

        let cfg = config(
            vec![
                TargetGroup::new("a", "a.html").with_task(TaskDefinition::new("t1", "x")),
                TargetGroup::new("a", "b.html").with_task(TaskDefinition::new("t2", "y")),
            ],
            1,
        );
        assert!(matches!(
            TaskMatrix::expand(&cfg),
            Err(ConfigError::DuplicateTarget(_))
        ));
    }

    #[test]
    fn test_expand_rejects_file_name_collisions() {
        let cfg = config(
            vec![
                TargetGroup::new("a_b", "a_b.html").with_task(TaskDefinition::new("c", "x")),
                TargetGroup::new("a", "a.html").with_task(TaskDefinition::new("b_c", "y")),
            ],
            3,
        );
        match TaskMatrix::expand(&cfg) {
            Err(ConfigError::FileNameCollision { first, second, stem }) => {
                assert_eq!(first, "a_b:c");
                assert_eq!(second, "a:b_c");
                assert_eq!(stem, "a_b_c");
            }
            other => panic!("expected file name collision, got {:?}", other),
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_file_stem() {
        let id = RunIdentity::new("login_page", "valid_login", 3);
        assert_eq!(id.file_stem(1), "login_page_valid_login");
        assert_eq!(id.file_stem(5), "login_page_valid_login_run3");
    }
}
