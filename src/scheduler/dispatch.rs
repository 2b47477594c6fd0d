//! The batch scheduler: resume, admission, dispatch and the final summary.
//!
//! One [`BatchScheduler::run`] call:
//!
//! 1. expands the task matrix (configuration errors are fatal),
//! 2. scans the results directory and restores progress from it,
//! 3. admits pending runs in matrix order, sequentially or through a
//!    [`ConcurrencyGate`], claiming each in the [`RunLedger`] first,
//! 4. records every terminal result as soon as it arrives,
//! 5. aggregates everything recorded and writes the summary artifact.
//!
//! Cancellation is cooperative: the token is checked before each admission
//! and at the top of the per-run routine. Runs already executing finish (or
//! hit their own timeout) and are recorded.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::worker_pool::{ConcurrencyGate, GatePermit};
use crate::batch::aggregate::MultiRunAggregator;
use crate::batch::config::BatchConfig;
use crate::batch::ledger::{Admission, AdmissionClaim, RunLedger};
use crate::batch::matrix::{MatrixEntry, RunIdentity, TaskMatrix};
use crate::batch::progress::ProgressTracker;
use crate::batch::recorder::{RunRecorder, RESULTS_DIR};
use crate::batch::resume::{clean_legacy_checkpoints, ResumeIndex, ResumeSummary};
use crate::batch::summary::{BatchErrorRecord, BatchSummarizer, BatchSummary};
use crate::error::{BatchError, RecordingError};
use crate::runner::{execute_run, ExecutionRequest, RunContext, RunExecutor, RunResult};

/// Drives one batch from configuration to summary.
pub struct BatchScheduler {
    config: BatchConfig,
    executor: Arc<dyn RunExecutor>,
    cancel: CancellationToken,
    span: Span,
    fresh: bool,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, executor: Arc<dyn RunExecutor>) -> Self {
        let span = info_span!("batch", batch_id = %config.batch_id());
        Self {
            config,
            executor,
            cancel: CancellationToken::new(),
            span,
            fresh: false,
        }
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Span every batch log line is emitted under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Discards recorded results and claims before starting.
    pub fn with_fresh_start(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops admitting new runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs the batch to completion, cancellation or early stop.
    ///
    /// Only an invalid configuration is returned as an error. Every other
    /// failure is recorded in the summary's error list.
    pub async fn run(&self) -> Result<BatchSummary, BatchError> {
        self.run_batch().instrument(self.span.clone()).await
    }

    async fn run_batch(&self) -> Result<BatchSummary, BatchError> {
        self.config.validate()?;
        let matrix = TaskMatrix::expand(&self.config)?;

        let settings = &self.config.batch_settings;
        let batch_id = self.config.batch_id();
        let batch_dir = self.config.batch_dir();
        let runs_per_task = matrix.runs_per_task();
        let workers = settings.worker_count();
        let start_time = Utc::now();

        info!(
            batch_name = %self.config.batch_name,
            batch_dir = %batch_dir.display(),
            total_tasks = matrix.total_tasks(),
            total_runs = matrix.total_runs(),
            runs_per_task,
            workers,
            executor = self.executor.name(),
            "Starting batch"
        );

        let recorder = RunRecorder::new(&batch_dir, runs_per_task)
            .with_individual_results(settings.save_individual_results);
        let mut state = DispatchState::new(
            ResumeIndex::empty(recorder.results_dir()),
            ProgressTracker::new(matrix.total_tasks(), runs_per_task),
        );

        if let Err(e) = recorder.prepare().await {
            warn!(error = %e, "Failed to prepare results directory");
            state.record_recording_error(&e);
        }

        let ledger = match RunLedger::open(&batch_dir).await {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                error!(error = %e, "Failed to open admission ledger");
                state.record_batch_error(e);
                None
            }
        };

        if self.fresh {
            self.clear_previous(&recorder, ledger.as_ref(), &mut state).await;
        }
        clean_legacy_checkpoints(&batch_dir).await;

        match ResumeIndex::scan(recorder.results_dir()).await {
            Ok(index) => state.index = index,
            Err(e) => {
                error!(error = %e, "Failed to scan recorded results");
                state.record_batch_error(e);
            }
        }

        let task_keys = matrix.task_keys();
        if !state.index.is_empty() {
            log_resume(&state.index.summary(matrix.total_tasks(), runs_per_task));
            state.progress.restore(&state.index, &task_keys);
        }

        let pending_runs = matrix
            .identities()
            .filter(|id| !state.index.should_skip(id, runs_per_task))
            .count();
        info!(pending_runs, "Dispatching runs");

        let exhausted = match ledger {
            Some(ledger) if !state.stop => {
                let run = RunSettings {
                    batch_id: &batch_id,
                    recorder: &recorder,
                    ledger: &ledger,
                    runs_per_task,
                };
                if workers > 1 {
                    state.log_every = settings
                        .progress_log_interval
                        .unwrap_or(pending_runs / 10)
                        .max(1);
                    self.dispatch_parallel(&matrix, &run, &mut state, workers).await
                } else {
                    self.dispatch_sequential(&matrix, &run, &mut state).await
                }
            }
            _ => pending_runs == 0,
        };

        if !exhausted {
            warn!(
                completed_runs = state.progress.state().completed_runs,
                total_runs = matrix.total_runs(),
                "Batch stopped before every run was admitted"
            );
        }
        state.progress.snapshot().log();

        let mut aggregator = MultiRunAggregator::new().with_runs_per_task(runs_per_task);
        aggregator.extend(state.index.results().cloned());
        let tasks = aggregator.finish(&task_keys);

        let summarizer = BatchSummarizer::new(
            &batch_id,
            &self.config.batch_name,
            matrix.total_tasks(),
            runs_per_task,
        );
        let mut summary = summarizer.summarize(tasks, state.errors, start_time, Utc::now(), !exhausted);

        match recorder.write_summary(&batch_id, &summary).await {
            Ok(path) => info!(path = %path.display(), "Batch summary written"),
            Err(e) => {
                warn!(error = %e, "Failed to write batch summary");
                summary.errors.push(BatchErrorRecord::from(&e));
            }
        }

        info!(
            total_tasks = summary.total_tasks,
            completed_tasks = summary.completed_tasks,
            successful_tasks = summary.successful_tasks,
            failed_tasks = summary.failed_tasks,
            success_rate = format!("{:.1}%", summary.success_rate * 100.0),
            average_score = format!("{:.3}", summary.average_score),
            errors = summary.errors.len(),
            interrupted = summary.interrupted,
            "Batch finished"
        );
        Ok(summary)
    }

    async fn clear_previous(
        &self,
        recorder: &RunRecorder,
        ledger: Option<&RunLedger>,
        state: &mut DispatchState,
    ) {
        match recorder.clear().await {
            Ok(removed) => warn!(removed, "Fresh start: discarded recorded results"),
            Err(e) => {
                warn!(error = %e, "Failed to discard recorded results");
                state.record_recording_error(&e);
            }
        }
        if let Some(ledger) = ledger {
            match ledger.clear().await {
                Ok(removed) => debug!(removed, "Fresh start: discarded admission claims"),
                Err(e) => {
                    warn!(error = %e, "Failed to discard admission claims");
                    state.record_batch_error(e);
                }
            }
        }
    }

    /// One run at a time, in matrix order. Returns true when every entry
    /// was considered.
    async fn dispatch_sequential(
        &self,
        matrix: &TaskMatrix<'_>,
        run: &RunSettings<'_>,
        state: &mut DispatchState,
    ) -> bool {
        let mut pending = matrix.entries();
        while let Some((entry, rest)) = pending.split_first() {
            if self.stop_requested(state) {
                break;
            }

            match self.admit(entry, run, state).await {
                Ok(Some(claim)) => {
                    let (request, span) = self.prepare_run(entry, run, state);
                    let completion = perform_run(
                        Arc::clone(&self.executor),
                        run.recorder.clone(),
                        request,
                        self.cancel.clone(),
                        claim,
                    )
                    .instrument(span)
                    .await;
                    self.handle_completion(completion, state);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(run = %entry.identity, error = %e, "Admission failed");
                    state.record_batch_error(e);
                    break;
                }
            }
            pending = rest;
        }
        pending.is_empty()
    }

    /// Up to `workers` runs in flight, admitted in matrix order.
    async fn dispatch_parallel(
        &self,
        matrix: &TaskMatrix<'_>,
        run: &RunSettings<'_>,
        state: &mut DispatchState,
        workers: usize,
    ) -> bool {
        let gate = ConcurrencyGate::new(workers);
        let mut in_flight: JoinSet<RunCompletion> = JoinSet::new();
        let mut pending = matrix.entries();

        while let Some((entry, rest)) = pending.split_first() {
            if self.stop_requested(state) {
                break;
            }

            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                Some(joined) = in_flight.join_next() => Step::Joined(joined),
                permit = gate.acquire() => Step::Slot(permit),
            };
            let permit = match step {
                Step::Cancelled => continue,
                Step::Joined(joined) => {
                    self.handle_joined(joined, state);
                    continue;
                }
                Step::Slot(Ok(permit)) => permit,
                Step::Slot(Err(e)) => {
                    state.record_batch_error(e);
                    break;
                }
            };

            // Re-check: a completion handled above may have stopped the batch.
            if self.stop_requested(state) {
                break;
            }

            match self.admit(entry, run, state).await {
                Ok(Some(claim)) => {
                    let (request, span) = self.prepare_run(entry, run, state);
                    in_flight.spawn(
                        run_with_permit(
                            permit,
                            perform_run(
                                Arc::clone(&self.executor),
                                run.recorder.clone(),
                                request,
                                self.cancel.clone(),
                                claim,
                            ),
                        )
                        .instrument(span),
                    );
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    error!(run = %entry.identity, error = %e, "Admission failed");
                    state.record_batch_error(e);
                    break;
                }
            }
            pending = rest;
        }

        gate.close();
        let remaining = in_flight.len();
        if remaining > 0 {
            info!(in_flight = remaining, "Waiting for in-flight runs");
        }
        while let Some(joined) = in_flight.join_next().await {
            self.handle_joined(joined, state);
        }

        let stats = gate.stats();
        debug!(
            admitted = stats.admitted,
            peak_in_flight = stats.peak_in_flight,
            capacity = stats.capacity,
            "Worker pool drained"
        );
        pending.is_empty()
    }

    fn stop_requested(&self, state: &mut DispatchState) -> bool {
        if self.cancel.is_cancelled() {
            if !state.progress.state().cancellation_requested {
                info!("Cancellation requested, no new runs will be admitted");
                state.progress.mark_cancelled();
            }
            return true;
        }
        state.stop
    }

    /// Decides whether `entry` runs now. Returns its claim when it does.
    async fn admit(
        &self,
        entry: &MatrixEntry<'_>,
        run: &RunSettings<'_>,
        state: &mut DispatchState,
    ) -> Result<Option<AdmissionClaim>, BatchError> {
        let identity = &entry.identity;
        if state.index.refresh(identity, run.runs_per_task).await {
            debug!(run = %identity, "Already recorded, skipping");
            return Ok(None);
        }

        let timeout = self.config.effective_timeout(entry.task);
        match run.ledger.try_claim(identity, timeout).await? {
            Admission::HeldElsewhere { owner } => {
                info!(run = %identity, owner = %owner, "Run claimed by another scheduler, skipping");
                Ok(None)
            }
            Admission::Claimed(claim) => {
                // A result may have landed between the scan and the claim.
                if state.index.refresh(identity, run.runs_per_task).await {
                    debug!(run = %identity, "Recorded while claiming, skipping");
                    return Ok(None);
                }
                Ok(Some(claim))
            }
        }
    }

    fn prepare_run(
        &self,
        entry: &MatrixEntry<'_>,
        run: &RunSettings<'_>,
        state: &mut DispatchState,
    ) -> (ExecutionRequest, Span) {
        let identity = &entry.identity;
        state.progress.run_started(identity);
        let span = info_span!(
            "run",
            target_id = %identity.target_id,
            task_id = %identity.task_id,
            run_number = identity.run_number,
        );
        (ExecutionRequest::for_entry(&self.config, entry, run.batch_id), span)
    }

    fn handle_joined(&self, joined: Result<RunCompletion, JoinError>, state: &mut DispatchState) {
        match joined {
            Ok(completion) => self.handle_completion(completion, state),
            Err(e) => {
                error!(error = %e, "Run task failed");
                state.record_batch_error(BatchError::Worker(e));
            }
        }
    }

    fn handle_completion(&self, completion: RunCompletion, state: &mut DispatchState) {
        let (result, recording_error) = match completion {
            RunCompletion::Finished { result, recording_error } => (result, recording_error),
            RunCompletion::NotStarted(identity) => {
                debug!(run = %identity, "Run not started, batch cancelled");
                state.progress.run_not_started(&identity);
                return;
            }
        };

        if let Some(e) = recording_error {
            state.record_recording_error(&e);
        }

        if let Some(task) = state.progress.run_finished(&result) {
            info!(
                task = %task.key,
                success = task.success,
                successful_runs = task.successful_runs,
                failed_runs = task.failed_runs,
                "Task completed"
            );
        }

        let success = result.is_success();
        let identity = result.identity.clone();
        state.index.insert(result);

        state.finished += 1;
        if state.finished % state.log_every == 0 {
            state.progress.snapshot().log();
        }

        if !success && !self.config.batch_settings.continue_on_failure && !state.stop {
            warn!(run = %identity, "Run did not succeed, stopping admissions");
            state.stop = true;
        }
    }
}

/// Reports how far an existing results directory already is, without
/// running anything.
pub async fn batch_status(config: &BatchConfig) -> Result<ResumeSummary, BatchError> {
    config.validate()?;
    let index = ResumeIndex::scan(config.batch_dir().join(RESULTS_DIR)).await?;
    Ok(index.summary(
        config.total_tasks(),
        config.batch_settings.runs_per_task,
    ))
}

fn log_resume(summary: &ResumeSummary) {
    info!(
        completed_runs = summary.completed_runs,
        total_runs = summary.total_runs,
        successful_runs = summary.successful_runs,
        failed_runs = summary.failed_runs,
        remaining_runs = summary.remaining_runs,
        completion = format!("{:.1}%", summary.completion_percentage),
        "Resuming batch"
    );
}

/// Borrowed pieces every admission needs.
struct RunSettings<'a> {
    batch_id: &'a str,
    recorder: &'a RunRecorder,
    ledger: &'a RunLedger,
    runs_per_task: u32,
}

/// Mutable bookkeeping owned by the dispatch loop.
struct DispatchState {
    index: ResumeIndex,
    progress: ProgressTracker,
    errors: Vec<BatchErrorRecord>,
    stop: bool,
    finished: usize,
    log_every: usize,
}

impl DispatchState {
    fn new(index: ResumeIndex, progress: ProgressTracker) -> Self {
        Self {
            index,
            progress,
            errors: Vec::new(),
            stop: false,
            finished: 0,
            log_every: 1,
        }
    }

    fn record_recording_error(&mut self, err: &RecordingError) {
        self.errors.push(BatchErrorRecord::from(err));
    }

    /// Records a scheduler failure; no further runs are admitted.
    fn record_batch_error(&mut self, err: BatchError) {
        self.errors.push(BatchErrorRecord::from(&err));
        self.stop = true;
    }
}

enum Step {
    Cancelled,
    Joined(Result<RunCompletion, JoinError>),
    Slot(Result<GatePermit, BatchError>),
}

/// What a dispatched unit of work hands back to the loop.
#[derive(Debug)]
enum RunCompletion {
    Finished {
        result: RunResult,
        recording_error: Option<RecordingError>,
    },
    NotStarted(RunIdentity),
}

async fn run_with_permit<F: std::future::Future>(permit: GatePermit, work: F) -> F::Output {
    let output = work.await;
    drop(permit);
    output
}

/// The per-run routine: execute, record, release the claim.
async fn perform_run(
    executor: Arc<dyn RunExecutor>,
    recorder: RunRecorder,
    request: ExecutionRequest,
    cancel: CancellationToken,
    claim: AdmissionClaim,
) -> RunCompletion {
    let ctx = RunContext::new(cancel, request.timeout);
    if ctx.is_cancelled() {
        claim.release().await;
        return RunCompletion::NotStarted(request.identity);
    }

    info!(timeout_secs = request.timeout.as_secs_f64(), "Starting run");
    let result = execute_run(executor.as_ref(), &request, &ctx).await;
    info!(
        status = %result.status,
        task_success = ?result.task_success,
        score = result.task_score,
        duration_seconds = format!("{:.2}", result.duration_seconds),
        "Run finished"
    );

    let recording_error = match recorder.record(&result).await {
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Failed to record run result");
            Some(e)
        }
    };
    claim.release().await;

    RunCompletion::Finished {
        result,
        recording_error,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::batch::config::{BatchSettings, TargetGroup, TaskDefinition};
    use crate::runner::{ExecutionOutcome, ExecutorError};

    struct Succeed;

    #[async_trait]
    impl RunExecutor for Succeed {
        async fn execute(
            &self,
            _request: &ExecutionRequest,
            _ctx: &RunContext,
        ) -> Result<ExecutionOutcome, ExecutorError> {
            Ok(ExecutionOutcome::success(1.0))
        }
    }

    fn config(dir: &TempDir) -> BatchConfig {
        BatchConfig::new(
            "dispatch unit",
            vec![TargetGroup::new("page", "page.html")
                .with_task(TaskDefinition::new("a", "Do a"))
                .with_task(TaskDefinition::new("b", "Do b"))],
        )
        .with_output_directory(dir.path())
        .with_settings(BatchSettings::default().with_global_timeout(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_status_before_and_after_run() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);

        let before = batch_status(&config).await.unwrap();
        assert_eq!(before.completed_runs, 0);
        assert_eq!(before.remaining_runs, 2);

        let scheduler = BatchScheduler::new(config.clone(), Arc::new(Succeed));
        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.successful_tasks, 2);

        let after = batch_status(&config).await.unwrap();
        assert_eq!(after.completed_runs, 2);
        assert_eq!(after.completion_percentage, 100.0);
    }

    #[tokio::test]
    async fn test_summary_artifact_written() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let scheduler = BatchScheduler::new(config.clone(), Arc::new(Succeed));
        let summary = scheduler.run().await.unwrap();

        let path = config
            .batch_dir()
            .join(format!("{}_results.json", summary.batch_id));
        let written: BatchSummary =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.total_tasks, 2);
        assert_eq!(written.tasks.len(), 2);
        assert!(!written.interrupted);
    }

    #[tokio::test]
    async fn test_fresh_start_reruns_everything() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        BatchScheduler::new(config.clone(), Arc::new(Succeed))
            .run()
            .await
            .unwrap();

        let summary = BatchScheduler::new(config.clone(), Arc::new(Succeed))
            .with_fresh_start(true)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.runs.total, 2);
        assert_eq!(summary.completed_tasks, 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let temp = TempDir::new().unwrap();
        let config = BatchConfig::new("empty", vec![]).with_output_directory(temp.path());
        let scheduler = BatchScheduler::new(config, Arc::new(Succeed));
        assert!(matches!(scheduler.run().await, Err(BatchError::Config(_))));
    }
}
