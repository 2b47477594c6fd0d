//! CLI command definitions for batch-eval.
//!
//! `run` executes (or resumes) a batch, `status` reports how far a batch
//! already is, `init` writes a sample configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::batch::{create_sample_config, load_batch_config, BatchConfig, BatchSummary, ResumeSummary};
use crate::runner::CommandExecutor;
use crate::scheduler::{batch_status, BatchScheduler};

/// Batch evaluation scheduler.
#[derive(Parser)]
#[command(name = "batch-eval")]
#[command(about = "Run evaluation batches with bounded concurrency and resume support")]
#[command(version)]
#[command(
    long_about = "batch-eval expands a batch configuration into targets x tasks x runs, executes every pending run through an external executor program, and aggregates repeated runs into task verdicts.\n\nRe-running the same configuration resumes from the results already recorded.\n\nExample usage:\n  batch-eval run --config batch.yaml --parallel 4 --executor ./run-agent.sh"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute a batch, resuming from recorded results.
    Run(RunArgs),

    /// Show how many runs of a batch are already recorded.
    Status(StatusArgs),

    /// Write a sample batch configuration.
    Init(InitArgs),
}

/// Arguments for `batch-eval run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Batch configuration file (.json, .yaml or .yml).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override the configured output directory.
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Run up to N runs in parallel (1 runs sequentially).
    #[arg(short = 'p', long)]
    pub parallel: Option<usize>,

    /// Override the number of runs per task.
    #[arg(short = 'r', long)]
    pub runs: Option<u32>,

    /// Override the fallback per-run timeout, in seconds.
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Stop admitting runs after the first run that does not succeed.
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Discard recorded results and start the batch over.
    #[arg(long)]
    pub fresh: bool,

    /// Program executed once per run. Receives the run request as JSON on
    /// stdin and prints the outcome as JSON on stdout.
    #[arg(short = 'e', long, env = "BATCH_EVAL_EXECUTOR")]
    pub executor: String,

    /// Working directory for the executor program.
    #[arg(long)]
    pub executor_dir: Option<PathBuf>,

    /// Arguments passed to the executor program (after `--`).
    #[arg(last = true)]
    pub executor_args: Vec<String>,

    /// Print the batch summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `batch-eval status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Batch configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override the configured output directory.
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `batch-eval init`.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Where to write the sample configuration (.json, .yaml or .yml).
    #[arg(default_value = "batch_config.yaml")]
    pub path: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Init(args) => run_init_command(args),
    }
}

// ============================================================================
// Run
// ============================================================================

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let config = apply_overrides(load_config(&args.config, args.output_dir.as_deref())?, &args);

    let mut executor = CommandExecutor::new(&args.executor).with_args(args.executor_args.clone());
    if let Some(dir) = &args.executor_dir {
        executor = executor.with_working_dir(dir);
    }

    let scheduler = BatchScheduler::new(config, Arc::new(executor)).with_fresh_start(args.fresh);

    let token = scheduler.cancellation_token();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight runs");
            token.cancel();
        }
    });

    let result = scheduler.run().await;
    signal.abort();
    let summary = result.context("Batch could not start")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if summary.has_batch_failure() {
        anyhow::bail!(
            "Batch {} stopped on {} scheduler error(s)",
            summary.batch_id,
            summary.errors.len()
        );
    }
    Ok(())
}

fn load_config(path: &Path, output_dir: Option<&Path>) -> anyhow::Result<BatchConfig> {
    let mut config = load_batch_config(path)
        .with_context(|| format!("Failed to load batch configuration {}", path.display()))?;
    if let Some(dir) = output_dir {
        config.output_directory = dir.to_path_buf();
    }
    Ok(config)
}

fn apply_overrides(mut config: BatchConfig, args: &RunArgs) -> BatchConfig {
    let mut settings = config.batch_settings.clone();
    if let Some(workers) = args.parallel {
        settings = settings.with_parallel_workers(workers);
    }
    if let Some(runs) = args.runs {
        settings = settings.with_runs_per_task(runs);
    }
    if let Some(timeout) = args.timeout {
        settings.global_timeout = Some(timeout);
    }
    if args.stop_on_failure {
        settings = settings.with_continue_on_failure(false);
    }
    config.batch_settings = settings;
    config
}

fn print_summary(summary: &BatchSummary) {
    println!("{}", "=".repeat(50));
    println!("📊 Batch Summary: {}", summary.batch_name);
    println!("{}", "=".repeat(50));
    println!("Batch ID: {}", summary.batch_id);
    println!("Runs per task: {}", summary.runs_per_task);
    println!(
        "Tasks: {} total, {} completed, {} incomplete",
        summary.total_tasks, summary.completed_tasks, summary.incomplete_tasks
    );
    println!("Successful: {}", summary.successful_tasks);
    println!("Failed: {}", summary.failed_tasks);
    println!("Success rate: {:.1}%", summary.success_rate * 100.0);
    println!("Average score: {:.3}", summary.average_score);
    println!(
        "Runs: {} completed, {} failed, {} timeout, {} cancelled",
        summary.runs.completed, summary.runs.failed, summary.runs.timeout, summary.runs.cancelled
    );
    println!(
        "Duration: {:.1}s (avg {:.1}s per run)",
        summary.duration_seconds, summary.average_duration_seconds
    );
    if summary.total_fields > 0 {
        println!(
            "Field accuracy: {}/{} ({:.1}%)",
            summary.correct_fields,
            summary.total_fields,
            summary.field_accuracy * 100.0
        );
    }

    if !summary.targets.is_empty() {
        println!("\n🎯 Per target:");
        for target in &summary.targets {
            println!(
                "  {:<24} {}/{} tasks ({:.1}%), avg score {:.3}",
                target.target_id,
                target.successful,
                target.total,
                target.success_rate * 100.0,
                target.average_score
            );
        }
    }

    if !summary.run_failures.is_empty() {
        println!("\n✗ Runs that did not complete:");
        for failure in &summary.run_failures {
            println!(
                "  {} [{}] {}",
                failure.identity,
                failure.status,
                failure.error_message.as_deref().unwrap_or("")
            );
        }
    }

    if !summary.errors.is_empty() {
        println!("\n⚠ Batch errors:");
        for error in &summary.errors {
            println!("  {} {}: {}", error.timestamp.to_rfc3339(), error.kind, error.message);
        }
    }

    if summary.interrupted {
        println!("\nBatch was interrupted; run the same command again to resume.");
    }
}

// ============================================================================
// Status
// ============================================================================

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config, args.output_dir.as_deref())?;
    let status = batch_status(&config)
        .await
        .with_context(|| format!("Failed to read results of {}", config.batch_id()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&config, &status);
    }
    Ok(())
}

fn print_status(config: &BatchConfig, status: &ResumeSummary) {
    println!("📋 {} ({})", config.batch_name, config.batch_id());
    println!("Directory: {}", config.batch_dir().display());
    println!(
        "Runs: {}/{} recorded ({:.1}%)",
        status.completed_runs, status.total_runs, status.completion_percentage
    );
    println!("Successful runs: {}", status.successful_runs);
    println!("Failed runs: {}", status.failed_runs);
    println!("Remaining runs: {}", status.remaining_runs);
}

// ============================================================================
// Init
// ============================================================================

fn run_init_command(args: InitArgs) -> anyhow::Result<()> {
    let path = create_sample_config(&args.path)
        .with_context(|| format!("Failed to write sample configuration {}", args.path.display()))?;
    info!(path = %path.display(), "Sample configuration written");
    println!("Sample configuration written to {}", path.display());
    println!("Run it with: batch-eval run --config {} --executor <program>", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "batch-eval",
            "run",
            "--config",
            "batch.yaml",
            "--parallel",
            "4",
            "--runs",
            "3",
            "--executor",
            "python3",
            "--",
            "agent.py",
            "--headless",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("batch.yaml"));
                assert_eq!(args.parallel, Some(4));
                assert_eq!(args.runs, Some(3));
                assert_eq!(args.executor, "python3");
                assert_eq!(args.executor_args, vec!["agent.py", "--headless"]);
                assert!(!args.fresh);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_overrides_apply_to_settings() {
        let cli = Cli::try_parse_from([
            "batch-eval",
            "run",
            "-c",
            "batch.json",
            "-p",
            "3",
            "--timeout",
            "12.5",
            "--stop-on-failure",
            "-e",
            "agent",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        let config = apply_overrides(crate::batch::sample_config(), &args);
        let settings = &config.batch_settings;
        assert!(settings.parallel_execution);
        assert_eq!(settings.worker_count(), 3);
        assert!(!settings.continue_on_failure);
        assert_eq!(settings.global_timeout, Some(12.5));
    }

    #[test]
    fn test_parse_init_default_path() {
        let cli = Cli::try_parse_from(["batch-eval", "init"]).unwrap();
        match cli.command {
            Commands::Init(args) => assert_eq!(args.path, PathBuf::from("batch_config.yaml")),
            _ => panic!("expected init command"),
        }
    }
}
