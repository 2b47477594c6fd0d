//! Dispatching the runs of a batch.
//!
//! - **BatchScheduler**: resumes, admits and dispatches runs, then summarizes
//! - **ConcurrencyGate**: bounds how many runs are in flight
//!
//! # Architecture
//!
//! ```text
//!   TaskMatrix (ordered)
//!          │
//!          ▼
//!   ResumeIndex.refresh ──skip──▶ (already recorded)
//!          │
//!          ▼
//!   RunLedger.try_claim ──held──▶ (another scheduler owns it)
//!          │
//!          ▼
//!   ConcurrencyGate (W slots)
//!          │
//!    ┌─────┼─────┐
//!    ▼     ▼     ▼
//!  run 1 run 2 run W ──▶ RunRecorder ──▶ ProgressTracker
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use batch_eval::batch::load_batch_config;
//! use batch_eval::runner::CommandExecutor;
//! use batch_eval::scheduler::BatchScheduler;
//!
//! let config = load_batch_config("batch.yaml")?;
//! let executor = Arc::new(CommandExecutor::new("./run-agent.sh"));
//! let scheduler = BatchScheduler::new(config, executor);
//!
//! let token = scheduler.cancellation_token();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     token.cancel();
//! });
//!
//! let summary = scheduler.run().await?;
//! println!("{}/{} tasks succeeded", summary.successful_tasks, summary.total_tasks);
//! ```

pub mod dispatch;
pub mod worker_pool;

pub use dispatch::{batch_status, BatchScheduler};
pub use worker_pool::{ConcurrencyGate, GatePermit, GateStats};
