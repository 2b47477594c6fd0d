//! Run execution.
//!
//! ```text
//! ExecutionRequest → RunExecutor (under timeout) → RunResult
//! ```
//!
//! The scheduler never talks to an executor directly: it calls
//! [`execute_run`], which owns the timeout and turns every outcome, error or
//! expiry into exactly one terminal [`RunResult`].

pub mod command;
pub mod executor;
pub mod result;

pub use command::CommandExecutor;
pub use executor::{
    execute_run, ExecutionOutcome, ExecutionRequest, ExecutorError, RunContext, RunExecutor,
};
pub use result::{FieldValidation, RunResult, RunStatus, TaskSuccess};
