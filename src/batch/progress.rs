//! Live progress of a batch at run and task granularity.
//!
//! Runs move `pending → in_flight → terminal`; tasks move
//! `pending → in_flight → completed` once `runs_per_task` runs are terminal.
//! Counters change only on the first terminal transition of an identity, so
//! replaying a result (for example after a resume) never double counts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::matrix::{RunIdentity, TaskKey};
use super::resume::ResumeIndex;
use crate::runner::{RunResult, RunStatus};

/// State of one run identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    InFlight,
    Terminal(RunStatus),
}

/// State of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    /// At least one run started.
    InFlight,
    Completed { success: bool },
}

#[derive(Debug, Clone, Copy)]
struct TaskProgress {
    state: TaskState,
    successful_runs: usize,
    failed_runs: usize,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            successful_runs: 0,
            failed_runs: 0,
        }
    }
}

impl TaskProgress {
    fn terminal_runs(&self) -> usize {
        self.successful_runs + self.failed_runs
    }
}

/// Batch-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct BatchState {
    pub total_tasks: usize,
    pub total_runs: usize,
    pub runs_per_task: u32,
    pub completed_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    /// Admitted runs without a terminal result yet.
    pub in_flight_runs: usize,
    pub completed_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub started_at: DateTime<Utc>,
    pub current_run: Option<RunIdentity>,
    pub cancellation_requested: bool,
}

/// Emitted when a run's completion also completes its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub key: TaskKey,
    pub success: bool,
    pub successful_runs: usize,
    pub failed_runs: usize,
}

/// Tracks progress for one batch invocation.
#[derive(Debug)]
pub struct ProgressTracker {
    state: BatchState,
    start: Instant,
    session_runs: usize,
    runs: HashMap<RunIdentity, RunState>,
    tasks: HashMap<TaskKey, TaskProgress>,
}

impl ProgressTracker {
    pub fn new(total_tasks: usize, runs_per_task: u32) -> Self {
        Self {
            state: BatchState {
                total_tasks,
                total_runs: total_tasks * runs_per_task as usize,
                runs_per_task,
                completed_runs: 0,
                successful_runs: 0,
                failed_runs: 0,
                in_flight_runs: 0,
                completed_tasks: 0,
                successful_tasks: 0,
                failed_tasks: 0,
                started_at: Utc::now(),
                current_run: None,
                cancellation_requested: false,
            },
            start: Instant::now(),
            session_runs: 0,
            runs: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    /// Seeds counters from results recorded by earlier invocations.
    ///
    /// Only tasks in `task_keys` are considered. Restored runs do not count
    /// toward this session's throughput, so they never skew the ETA.
    pub fn restore(&mut self, index: &ResumeIndex, task_keys: &[TaskKey]) {
        for key in task_keys {
            for result in index.results_for(key) {
                self.apply_terminal(result);
            }
        }

        info!(
            completed_tasks = self.state.completed_tasks,
            total_tasks = self.state.total_tasks,
            completed_runs = self.state.completed_runs,
            total_runs = self.state.total_runs,
            successful_tasks = self.state.successful_tasks,
            failed_tasks = self.state.failed_tasks,
            "Progress restored"
        );
    }

    /// Marks a run as admitted.
    pub fn run_started(&mut self, identity: &RunIdentity) {
        let state = self.runs.entry(identity.clone()).or_insert(RunState::Pending);
        if *state == RunState::Pending {
            *state = RunState::InFlight;
            self.state.in_flight_runs += 1;
        }
        let task = self.tasks.entry(identity.task_key()).or_default();
        if task.state == TaskState::Pending {
            task.state = TaskState::InFlight;
        }
        self.state.current_run = Some(identity.clone());
    }

    /// Returns an admitted run that never started (the batch was cancelled
    /// first) to pending.
    pub fn run_not_started(&mut self, identity: &RunIdentity) {
        if self.run_state(identity) != RunState::InFlight {
            return;
        }
        self.runs.insert(identity.clone(), RunState::Pending);
        self.state.in_flight_runs = self.state.in_flight_runs.saturating_sub(1);
        if self.state.current_run.as_ref() == Some(identity) {
            self.state.current_run = None;
        }

        let key = identity.task_key();
        let task_started = self
            .runs
            .iter()
            .any(|(id, state)| id.belongs_to(&key) && *state != RunState::Pending);
        if let Some(task) = self.tasks.get_mut(&key) {
            if task.state == TaskState::InFlight && !task_started {
                task.state = TaskState::Pending;
            }
        }
    }

    /// Records a terminal result. Returns the task completion it triggered,
    /// if any. Repeated calls for the same identity are ignored.
    pub fn run_finished(&mut self, result: &RunResult) -> Option<TaskCompletion> {
        if matches!(self.run_state(&result.identity), RunState::Terminal(_)) {
            return None;
        }
        self.session_runs += 1;
        self.apply_terminal(result)
    }

    fn apply_terminal(&mut self, result: &RunResult) -> Option<TaskCompletion> {
        let runs_per_task = self.state.runs_per_task as usize;
        let success = result.is_success();

        // Unnumbered results from older batches share run number 1 with a
        // possible numbered result; count each only once per identity.
        if let Some(RunState::Terminal(_)) = self.runs.get(&result.identity) {
            return None;
        }
        let previous = self
            .runs
            .insert(result.identity.clone(), RunState::Terminal(result.status));
        if previous == Some(RunState::InFlight) {
            self.state.in_flight_runs = self.state.in_flight_runs.saturating_sub(1);
        }

        self.state.completed_runs += 1;
        if success {
            self.state.successful_runs += 1;
        } else {
            self.state.failed_runs += 1;
        }

        let key = result.identity.task_key();
        let task = self.tasks.entry(key.clone()).or_default();
        if success {
            task.successful_runs += 1;
        } else {
            task.failed_runs += 1;
        }
        if task.state == TaskState::Pending {
            task.state = TaskState::InFlight;
        }

        if matches!(task.state, TaskState::Completed { .. }) || task.terminal_runs() < runs_per_task {
            return None;
        }

        // Majority of runs; ties count as failed.
        let task_success = task.successful_runs > task.failed_runs;
        task.state = TaskState::Completed { success: task_success };
        let completion = TaskCompletion {
            key,
            success: task_success,
            successful_runs: task.successful_runs,
            failed_runs: task.failed_runs,
        };

        self.state.completed_tasks += 1;
        if task_success {
            self.state.successful_tasks += 1;
        } else {
            self.state.failed_tasks += 1;
        }
        Some(completion)
    }

    pub fn mark_cancelled(&mut self) {
        self.state.cancellation_requested = true;
    }

    pub fn run_state(&self, identity: &RunIdentity) -> RunState {
        self.runs.get(identity).copied().unwrap_or(RunState::Pending)
    }

    pub fn task_state(&self, key: &TaskKey) -> TaskState {
        self.tasks.get(key).map_or(TaskState::Pending, |t| t.state)
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Estimated time to finish, from this session's throughput.
    pub fn eta(&self) -> Option<Duration> {
        if self.session_runs == 0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let rate = self.session_runs as f64 / elapsed;
        let remaining = self.state.total_runs.saturating_sub(self.state.completed_runs);
        Duration::try_from_secs_f64(remaining as f64 / rate).ok()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = &self.state;
        ProgressSnapshot {
            completed_runs: s.completed_runs,
            total_runs: s.total_runs,
            successful_runs: s.successful_runs,
            failed_runs: s.failed_runs,
            in_flight_runs: s.in_flight_runs,
            completed_tasks: s.completed_tasks,
            total_tasks: s.total_tasks,
            successful_tasks: s.successful_tasks,
            failed_tasks: s.failed_tasks,
            run_progress_pct: percentage(s.completed_runs, s.total_runs),
            task_progress_pct: percentage(s.completed_tasks, s.total_tasks),
            run_success_rate: percentage(s.successful_runs, s.completed_runs),
            task_success_rate: percentage(s.successful_tasks, s.completed_tasks),
            multi_run: s.runs_per_task > 1,
            elapsed: self.elapsed(),
            eta: self.eta(),
        }
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Progress at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub completed_runs: usize,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub in_flight_runs: usize,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub run_progress_pct: f64,
    pub task_progress_pct: f64,
    pub run_success_rate: f64,
    pub task_success_rate: f64,
    pub multi_run: bool,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn log(&self) {
        let eta = self.eta.map(format_clock).unwrap_or_else(|| "N/A".to_string());
        if self.multi_run {
            info!(
                tasks = format!("{}/{}", self.completed_tasks, self.total_tasks),
                task_progress = format!("{:.1}%", self.task_progress_pct),
                runs = format!("{}/{}", self.completed_runs, self.total_runs),
                run_progress = format!("{:.1}%", self.run_progress_pct),
                successful_runs = self.successful_runs,
                failed_runs = self.failed_runs,
                in_flight = self.in_flight_runs,
                success_rate = format!("{:.1}%", self.run_success_rate),
                elapsed = %format_clock(self.elapsed),
                eta = %eta,
                "Batch progress"
            );
        } else {
            info!(
                tasks = format!("{}/{}", self.completed_tasks, self.total_tasks),
                progress = format!("{:.1}%", self.run_progress_pct),
                successful_tasks = self.successful_tasks,
                failed_tasks = self.failed_tasks,
                in_flight = self.in_flight_runs,
                success_rate = format!("{:.1}%", self.task_success_rate),
                elapsed = %format_clock(self.elapsed),
                eta = %eta,
                "Batch progress"
            );
        }
    }
}

/// `mm:ss`.
fn format_clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::batch::recorder::RunRecorder;
    use crate::runner::TaskSuccess;

    fn result(task: &str, run: u32, success: bool) -> RunResult {
        RunResult::completed(
            RunIdentity::new("page", task, run),
            TaskSuccess::from(success),
            0.0,
            Utc::now(),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_task_completes_on_majority() {
        let mut tracker = ProgressTracker::new(1, 3);
        let id = RunIdentity::new("page", "t", 1);
        tracker.run_started(&id);
        assert_eq!(tracker.run_state(&id), RunState::InFlight);
        assert_eq!(tracker.task_state(&id.task_key()), TaskState::InFlight);

        assert!(tracker.run_finished(&result("t", 1, true)).is_none());
        assert!(tracker.run_finished(&result("t", 2, true)).is_none());
        let completion = tracker.run_finished(&result("t", 3, false)).unwrap();

        assert!(completion.success);
        assert_eq!(completion.successful_runs, 2);
        let state = tracker.state();
        assert_eq!(state.completed_runs, 3);
        assert_eq!(state.successful_runs, 2);
        assert_eq!(state.completed_tasks, 1);
        assert_eq!(state.successful_tasks, 1);
        assert_eq!(
            tracker.run_state(&RunIdentity::new("page", "t", 3)),
            RunState::Terminal(RunStatus::Completed)
        );
    }

    #[test]
    fn test_run_not_started_returns_to_pending() {
        let mut tracker = ProgressTracker::new(2, 2);
        let first = RunIdentity::new("page", "t", 1);
        let second = RunIdentity::new("page", "t", 2);
        tracker.run_started(&first);
        tracker.run_started(&second);
        assert_eq!(tracker.snapshot().in_flight_runs, 2);

        tracker.run_finished(&result("t", 1, true));
        tracker.run_not_started(&second);

        assert_eq!(tracker.run_state(&second), RunState::Pending);
        assert_eq!(tracker.snapshot().in_flight_runs, 0);
        // Run 1 finished, so the task itself has started.
        assert_eq!(tracker.task_state(&first.task_key()), TaskState::InFlight);

        let other = RunIdentity::new("page", "u", 1);
        tracker.run_started(&other);
        tracker.run_not_started(&other);
        assert_eq!(tracker.task_state(&other.task_key()), TaskState::Pending);
        assert!(tracker.state().current_run.is_none());
        assert_eq!(tracker.state().completed_runs, 1);
    }

    #[test]
    fn test_tie_counts_as_failed() {
        let mut tracker = ProgressTracker::new(1, 2);
        tracker.run_finished(&result("t", 1, true));
        let completion = tracker.run_finished(&result("t", 2, false)).unwrap();
        assert!(!completion.success);
        assert_eq!(tracker.state().failed_tasks, 1);
    }

    #[test]
    fn test_replayed_result_is_counted_once() {
        let mut tracker = ProgressTracker::new(2, 1);
        let first = result("t", 1, true);
        assert!(tracker.run_finished(&first).is_some());
        assert!(tracker.run_finished(&first).is_none());

        let state = tracker.state();
        assert_eq!(state.completed_runs, 1);
        assert_eq!(state.completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_restore_from_index() {
        let temp = TempDir::new().unwrap();
        let recorder = RunRecorder::new(temp.path(), 2);
        recorder.record(&result("done", 1, true)).await.unwrap();
        recorder.record(&result("done", 2, true)).await.unwrap();
        recorder.record(&result("half", 1, false)).await.unwrap();
        recorder.record(&result("other", 1, true)).await.unwrap();

        let index = ResumeIndex::scan(recorder.results_dir()).await.unwrap();
        let keys = vec![TaskKey::new("page", "done"), TaskKey::new("page", "half")];
        let mut tracker = ProgressTracker::new(2, 2);
        tracker.restore(&index, &keys);

        let state = tracker.state();
        assert_eq!(state.completed_runs, 3);
        assert_eq!(state.completed_tasks, 1);
        assert_eq!(state.successful_tasks, 1);
        assert_eq!(tracker.task_state(&keys[1]), TaskState::InFlight);
        // Nothing ran in this session yet.
        assert!(tracker.eta().is_none());

        // A replay of a restored run does not move the counters.
        assert!(tracker.run_finished(&result("done", 1, true)).is_none());
        assert_eq!(tracker.state().completed_runs, 3);

        let completion = tracker.run_finished(&result("half", 2, true)).unwrap();
        assert!(!completion.success);
    }

    #[test]
    fn test_snapshot_percentages() {
        let mut tracker = ProgressTracker::new(4, 1);
        tracker.run_finished(&result("a", 1, true));
        tracker.run_finished(&result("b", 1, false));

        let snap = tracker.snapshot();
        assert_eq!(snap.run_progress_pct, 50.0);
        assert_eq!(snap.task_success_rate, 50.0);
        assert!(!snap.multi_run);
        assert!(snap.eta.is_some());
        snap.log();
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(Duration::from_secs(125)), "02:05");
        assert_eq!(format_clock(Duration::ZERO), "00:00");
    }
}
