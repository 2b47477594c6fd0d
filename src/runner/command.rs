//! Executor that runs an external program per run.
//!
//! The request is written to the program's stdin as JSON and the program
//! answers with an [`ExecutionOutcome`] JSON document on stdout. Identity is
//! also exported through `BATCH_TARGET_ID`, `BATCH_TASK_ID` and
//! `BATCH_RUN_NUMBER`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::executor::{ExecutionOutcome, ExecutionRequest, ExecutorError, RunContext, RunExecutor};

/// Runs a command-line program for every run.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env_vars: HashMap<String, String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env_vars: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        cmd.env("BATCH_ID", &request.batch_id)
            .env("BATCH_TARGET_ID", &request.identity.target_id)
            .env("BATCH_TASK_ID", &request.identity.task_id)
            .env("BATCH_RUN_NUMBER", request.identity.run_number.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The run's timeout drops this future; the child must not outlive it.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RunExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        _ctx: &RunContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ExecutorError::Failed(format!("Failed to encode request: {}", e)))?;

        info!(program = %self.program, run = %request.identity, "Starting executor process");

        let mut child = self
            .build_command(request)
            .spawn()
            .map_err(|e| ExecutorError::Failed(format!("Failed to spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {
                    stdin.shutdown().await.ok();
                }
                // Programs that ignore the request close stdin early.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "Executor closed stdin before reading request");
                }
                Err(e) => {
                    return Err(ExecutorError::Failed(format!("Failed to write request: {}", e)));
                }
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(ExecutorError::Failed(format!(
                "{} exited with code {}: {}",
                self.program,
                code,
                last_line(&stderr).unwrap_or("no stderr output")
            )));
        }

        debug!(program = %self.program, bytes = output.stdout.len(), "Executor process finished");
        parse_outcome(&stdout)
    }
}

/// Parses the outcome from stdout: the whole document, else its last line.
fn parse_outcome(stdout: &str) -> Result<ExecutionOutcome, ExecutorError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ExecutorError::InvalidOutput("executor printed nothing".to_string()));
    }
    if let Ok(outcome) = serde_json::from_str(trimmed) {
        return Ok(outcome);
    }
    let line = last_line(trimmed).unwrap_or(trimmed);
    serde_json::from_str(line).map_err(|e| ExecutorError::InvalidOutput(format!("{}: {}", e, line)))
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::batch::matrix::RunIdentity;
    use crate::runner::result::TaskSuccess;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            batch_id: "batch_cmd".to_string(),
            identity: RunIdentity::new("page", "submit", 3),
            total_runs: 3,
            target_location: "page.html".to_string(),
            task_description: "Submit the form".to_string(),
            success_criteria: serde_json::Value::Null,
            agent_config: serde_json::Map::new(),
            environment_config: None,
            max_steps: 10,
            timeout: Duration::from_secs(10),
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(CancellationToken::new(), Duration::from_secs(10))
    }

    fn sh(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_parse_outcome_last_line() {
        let outcome = parse_outcome("loading agent...\n{\"task_success\": false, \"task_score\": 0.25}\n").unwrap();
        assert_eq!(outcome.task_success, TaskSuccess::False);
        assert_eq!(outcome.task_score, 0.25);

        assert!(matches!(parse_outcome("   "), Err(ExecutorError::InvalidOutput(_))));
        assert!(matches!(parse_outcome("not json"), Err(ExecutorError::InvalidOutput(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reports_outcome() {
        let executor = sh(
            r#"cat > /dev/null; printf '{"task_success": true, "task_score": 1.0, "details": {"task": "%s", "run": %s}}' "$BATCH_TASK_ID" "$BATCH_RUN_NUMBER""#,
        );
        let outcome = executor.execute(&request(), &ctx()).await.unwrap();
        assert_eq!(outcome.task_success, TaskSuccess::True);
        assert_eq!(outcome.details["task"], "submit");
        assert_eq!(outcome.details["run"], 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reads_request_from_stdin() {
        let executor = sh(r#"req=$(cat); case "$req" in *'"task_id":"submit"'*) echo '{"task_success": true}';; *) echo '{"task_success": false}';; esac"#);
        let outcome = executor.execute(&request(), &ctx()).await.unwrap();
        assert_eq!(outcome.task_success, TaskSuccess::True);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_nonzero_exit_fails() {
        let executor = sh("cat > /dev/null; echo 'browser crashed' >&2; exit 3");
        let err = executor.execute(&request(), &ctx()).await.unwrap_err();
        match err {
            ExecutorError::Failed(message) => {
                assert!(message.contains("code 3"));
                assert!(message.contains("browser crashed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let executor = CommandExecutor::new("definitely-not-an-installed-executor");
        let err = executor.execute(&request(), &ctx()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(_)));
    }
}
