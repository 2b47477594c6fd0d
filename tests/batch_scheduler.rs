//! Integration tests for the batch scheduler.
//!
//! Every test drives the public API with an in-process executor stub and a
//! temporary output directory.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_eval::batch::{
    Admission, BatchConfig, BatchSettings, ResumeIndex, RunIdentity, RunLedger, TargetGroup,
    TaskDefinition, RESULTS_DIR,
};
use batch_eval::runner::{
    ExecutionOutcome, ExecutionRequest, ExecutorError, RunContext, RunExecutor, RunStatus,
};
use batch_eval::scheduler::BatchScheduler;
use batch_eval::{BatchError, ConfigError};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Executor stub that counts calls and in-flight runs.
#[derive(Default)]
struct StubExecutor {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    delay: Duration,
    failing_targets: Vec<&'static str>,
    failing_runs: Vec<u32>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl StubExecutor {
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_target(mut self, target: &'static str) -> Self {
        self.failing_targets.push(target);
        self
    }

    fn failing_run(mut self, run_number: u32) -> Self {
        self.failing_runs.push(run_number);
        self
    }

    fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunExecutor for StubExecutor {
    fn name(&self) -> &str {
        "stub"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        _ctx: &RunContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some((after, token)) = &self.cancel_after {
            if calls >= *after {
                token.cancel();
            }
        }

        let identity = &request.identity;
        if self.failing_targets.contains(&identity.target_id.as_str()) {
            return Err(ExecutorError::Failed(format!(
                "agent crashed on {}",
                identity.target_id
            )));
        }
        if self.failing_runs.contains(&identity.run_number) {
            return Ok(ExecutionOutcome::failure(0.0));
        }
        Ok(ExecutionOutcome::success(1.0))
    }
}

fn batch(dir: &Path, targets: Vec<(&str, Vec<&str>)>, settings: BatchSettings) -> BatchConfig {
    let targets = targets
        .into_iter()
        .map(|(target, tasks)| {
            tasks.into_iter().fold(
                TargetGroup::new(target, format!("{}.html", target)),
                |group, task| group.with_task(TaskDefinition::new(task, format!("Complete {}", task))),
            )
        })
        .collect();
    BatchConfig::new("integration batch", targets)
        .with_output_directory(dir)
        .with_settings(settings.with_global_timeout(Duration::from_secs(10)))
}

fn result_files(config: &BatchConfig) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(config.batch_dir().join(RESULTS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".json") && !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_two_targets_all_succeed() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("login", vec!["submit"]), ("contact", vec!["send"])],
        BatchSettings::default(),
    );
    let executor = Arc::new(StubExecutor::default());

    let summary = BatchScheduler::new(config.clone(), executor.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total_tasks, 2);
    assert_eq!(summary.completed_tasks, 2);
    assert_eq!(summary.successful_tasks, 2);
    assert_eq!(summary.success_rate, 1.0);
    assert!(summary.run_failures.is_empty());
    assert!(!summary.interrupted);
    assert_eq!(executor.calls(), 2);
    assert_eq!(
        result_files(&config),
        vec!["contact_send.json".to_string(), "login_submit.json".to_string()]
    );
}

#[tokio::test]
async fn test_second_target_failure_is_reported() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("login", vec!["submit"]), ("contact", vec!["send"])],
        BatchSettings::default(),
    );
    let executor = Arc::new(StubExecutor::default().failing_target("contact"));

    let summary = BatchScheduler::new(config, executor).run().await.unwrap();

    assert_eq!(summary.successful_tasks, 1);
    assert_eq!(summary.failed_tasks, 1);
    assert_eq!(summary.run_failures.len(), 1);
    let failure = &summary.run_failures[0];
    assert_eq!(failure.identity, RunIdentity::new("contact", "send", 1));
    assert_eq!(failure.status, RunStatus::Failed);
    assert!(failure
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("agent crashed on contact")));
    assert!(summary.errors.is_empty());
}

#[tokio::test]
async fn test_majority_of_three_runs() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("form", vec!["fill"])],
        BatchSettings::default().with_runs_per_task(3),
    );
    let executor = Arc::new(StubExecutor::default().failing_run(3));

    let summary = BatchScheduler::new(config.clone(), executor).run().await.unwrap();

    assert_eq!(summary.tasks.len(), 1);
    let task = &summary.tasks[0];
    assert_eq!(task.total_runs, 3);
    assert_eq!(task.successful_runs, 2);
    assert_eq!(task.failed_runs, 1);
    assert!((task.success_rate_across_runs - 2.0 / 3.0).abs() < 1e-9);
    assert!(task.task_success);
    assert_eq!(summary.successful_tasks, 1);
    assert_eq!(
        result_files(&config),
        vec![
            "form_fill_run1.json".to_string(),
            "form_fill_run2.json".to_string(),
            "form_fill_run3.json".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_parallel_runs_stay_within_worker_bound() {
    let temp = TempDir::new().unwrap();
    let tasks = vec!["t1", "t2", "t3", "t4", "t5", "t6"];
    let config = batch(
        temp.path(),
        vec![("a", tasks.clone()), ("b", tasks)],
        BatchSettings::default().with_parallel_workers(3),
    );
    let executor = Arc::new(StubExecutor::default().with_delay(Duration::from_millis(20)));

    let summary = BatchScheduler::new(config, executor.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(executor.calls(), 12);
    assert!(executor.peak() <= 3, "observed {} runs in flight", executor.peak());
    assert_eq!(summary.runs.total, 12);
    assert_eq!(summary.successful_tasks, 12);
}

#[tokio::test]
async fn test_slow_run_times_out() {
    let temp = TempDir::new().unwrap();
    let config = BatchConfig::new(
        "timeout batch",
        vec![TargetGroup::new("slow", "slow.html")
            .with_task(TaskDefinition::new("wait", "Wait").with_timeout(Duration::from_millis(50)))
            .with_task(TaskDefinition::new("fast", "Go"))],
    )
    .with_output_directory(temp.path());
    let executor = Arc::new(SlowOnce::default());

    let summary = BatchScheduler::new(config, executor).run().await.unwrap();

    assert_eq!(summary.runs.timeout, 1);
    assert_eq!(summary.run_failures.len(), 1);
    assert_eq!(summary.run_failures[0].status, RunStatus::Timeout);
    // The batch carries on after the timeout.
    assert_eq!(summary.successful_tasks, 1);
    assert_eq!(summary.completed_tasks, 2);
}

/// Sleeps well past the timeout on the `wait` task only.
#[derive(Default)]
struct SlowOnce;

#[async_trait]
impl RunExecutor for SlowOnce {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        _ctx: &RunContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        if request.identity.task_id == "wait" {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(ExecutionOutcome::success(1.0))
    }
}

#[tokio::test]
async fn test_resume_skips_recorded_runs() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("a", vec!["t1", "t2"]), ("b", vec!["t1", "t2"])],
        BatchSettings::default(),
    );

    let token = CancellationToken::new();
    let first = Arc::new(StubExecutor::default().cancel_after(2, token.clone()));
    let interrupted = BatchScheduler::new(config.clone(), first.clone())
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    assert_eq!(first.calls(), 2);
    assert!(interrupted.interrupted);
    assert_eq!(interrupted.completed_tasks, 2);
    assert_eq!(interrupted.total_tasks, 4);

    let second = Arc::new(StubExecutor::default());
    let resumed = BatchScheduler::new(config.clone(), second.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(second.calls(), 2);
    assert!(!resumed.interrupted);
    assert_eq!(resumed.completed_tasks, 4);
    assert_eq!(resumed.runs.total, 4);

    // Nothing left to do on a third pass.
    let third = Arc::new(StubExecutor::default());
    BatchScheduler::new(config.clone(), third.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(third.calls(), 0);
    assert_eq!(result_files(&config).len(), 4);
}

#[tokio::test]
async fn test_resume_scan_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("a", vec!["t1", "t2"])],
        BatchSettings::default().with_runs_per_task(2),
    );
    BatchScheduler::new(config.clone(), Arc::new(StubExecutor::default()))
        .run()
        .await
        .unwrap();

    let results_dir = config.batch_dir().join(RESULTS_DIR);
    let first = ResumeIndex::scan(&results_dir).await.unwrap();
    let second = ResumeIndex::scan(&results_dir).await.unwrap();

    let first_ids: Vec<&RunIdentity> = first.identities().collect();
    let second_ids: Vec<&RunIdentity> = second.identities().collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(first_ids.len(), 4);
    for id in first_ids {
        assert!(second.should_skip(id, 2));
    }
}

#[tokio::test]
async fn test_parallel_resume_never_over_executes() {
    let temp = TempDir::new().unwrap();
    let tasks = vec!["t1", "t2", "t3"];
    let config = batch(
        temp.path(),
        vec![("a", tasks.clone()), ("b", tasks)],
        BatchSettings::default()
            .with_parallel_workers(2)
            .with_runs_per_task(2),
    );

    let token = CancellationToken::new();
    let first = Arc::new(
        StubExecutor::default()
            .with_delay(Duration::from_millis(5))
            .cancel_after(3, token.clone()),
    );
    BatchScheduler::new(config.clone(), first.clone())
        .with_cancellation(token)
        .run()
        .await
        .unwrap();

    let second = Arc::new(StubExecutor::default());
    let resumed = BatchScheduler::new(config.clone(), second.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(first.calls() + second.calls(), 12);
    assert_eq!(result_files(&config).len(), 12);
    for task in &resumed.tasks {
        assert_eq!(task.total_runs, 2);
    }
    assert_eq!(resumed.completed_tasks, 6);
}

#[tokio::test]
async fn test_stop_on_first_failure() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("broken", vec!["t1"]), ("ok", vec!["t1", "t2"])],
        BatchSettings::default().with_continue_on_failure(false),
    );
    let executor = Arc::new(StubExecutor::default().failing_target("broken"));

    let summary = BatchScheduler::new(config, executor.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(executor.calls(), 1);
    assert!(summary.interrupted);
    assert_eq!(summary.runs.total, 1);
    assert_eq!(summary.failed_tasks, 1);
    assert_eq!(summary.total_tasks, 3);
}

#[tokio::test]
async fn test_cancelled_batch_still_summarizes() {
    let temp = TempDir::new().unwrap();
    let config = batch(temp.path(), vec![("a", vec!["t1", "t2"])], BatchSettings::default());
    let executor = Arc::new(StubExecutor::default());

    let scheduler = BatchScheduler::new(config.clone(), executor.clone());
    scheduler.cancel();
    let summary = scheduler.run().await.unwrap();

    assert_eq!(executor.calls(), 0);
    assert!(summary.interrupted);
    assert_eq!(summary.total_tasks, 2);
    assert!(summary.tasks.is_empty());
    assert!(config
        .batch_dir()
        .join(format!("{}_results.json", summary.batch_id))
        .exists());
}

#[tokio::test]
async fn test_run_claimed_elsewhere_is_skipped() {
    let temp = TempDir::new().unwrap();
    let config = batch(temp.path(), vec![("a", vec!["t1", "t2"])], BatchSettings::default());

    let other = RunLedger::open(&config.batch_dir()).await.unwrap();
    let held = match other
        .try_claim(&RunIdentity::new("a", "t1", 1), Duration::from_secs(600))
        .await
        .unwrap()
    {
        Admission::Claimed(claim) => claim,
        Admission::HeldElsewhere { .. } => panic!("claim should be free"),
    };

    let executor = Arc::new(StubExecutor::default());
    let summary = BatchScheduler::new(config.clone(), executor.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(executor.calls(), 1);
    assert_eq!(result_files(&config), vec!["a_t2.json".to_string()]);
    assert_eq!(summary.completed_tasks, 1);
    drop(held);
}

#[tokio::test]
async fn test_colliding_result_names_are_rejected() {
    let temp = TempDir::new().unwrap();
    let config = batch(
        temp.path(),
        vec![("a_b", vec!["c"]), ("a", vec!["b_c"])],
        BatchSettings::default(),
    );
    let executor = Arc::new(StubExecutor::default());

    let outcome = BatchScheduler::new(config.clone(), executor.clone()).run().await;
    assert!(matches!(
        outcome,
        Err(BatchError::Config(ConfigError::FileNameCollision { .. }))
    ));
    assert_eq!(executor.calls(), 0);
    assert!(!config.batch_dir().join(RESULTS_DIR).exists());
}

#[tokio::test]
async fn test_out_of_range_timeout_is_rejected() {
    let temp = TempDir::new().unwrap();
    let mut config = batch(temp.path(), vec![("a", vec!["t1"])], BatchSettings::default());
    config.batch_settings.global_timeout = Some(1e300);
    let executor = Arc::new(StubExecutor::default());

    let outcome = BatchScheduler::new(config, executor.clone()).run().await;
    assert!(matches!(
        outcome,
        Err(BatchError::Config(ConfigError::InvalidValue { .. }))
    ));
    assert_eq!(executor.calls(), 0);
}
