//! Batch model and bookkeeping.
//!
//! ```text
//! BatchConfig → TaskMatrix → ResumeIndex filter → (scheduler) →
//!     RunRecorder + ProgressTracker → MultiRunAggregator → BatchSummarizer
//! ```
//!
//! Everything here is independent of how runs are dispatched; the
//! [`scheduler`](crate::scheduler) module drives these pieces.

pub mod aggregate;
pub mod config;
pub mod ledger;
pub mod matrix;
pub mod progress;
pub mod recorder;
pub mod resume;
pub mod summary;

pub use aggregate::{MultiRunAggregator, TaskAggregateResult};
pub use config::{
    create_sample_config, load_batch_config, sample_config, BatchConfig, BatchSettings,
    TargetGroup, TaskDefinition, DEFAULT_MAX_STEPS, DEFAULT_RUN_TIMEOUT,
};
pub use ledger::{Admission, AdmissionClaim, RunLedger};
pub use matrix::{MatrixEntry, RunIdentity, TaskKey, TaskMatrix};
pub use progress::{BatchState, ProgressSnapshot, ProgressTracker, RunState, TaskState};
pub use recorder::{RunRecorder, RESULTS_DIR};
pub use resume::{clean_legacy_checkpoints, ResumeIndex, ResumeSummary};
pub use summary::{
    BatchErrorRecord, BatchSummarizer, BatchSummary, RunCounters, RunFailure, TargetStats,
    RECORDING_FAILURE,
};
