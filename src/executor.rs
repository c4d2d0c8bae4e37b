use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::credentials::Credentials;
use crate::error::ExecutorError;
use crate::model::{BookingRequest, ExecutionOutcome};

/// Performs the real-world reservation. Slow, unreliable, not idempotent.
#[async_trait]
pub trait BookingExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &BookingRequest,
        credentials: &Credentials,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}

#[derive(Serialize)]
struct ExecutorJob<'a> {
    request_id: String,
    user_id: &'a str,
    court: u32,
    date: String,
    time_slot: String,
    username: &'a str,
    password: &'a str,
}

/// Runs an external program per attempt: one JSON job on stdin, one JSON outcome on stdout.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    /// `command` is split on whitespace into program and arguments.
    pub fn new(command: &str, timeout: Duration) -> Self {
        let mut parts = command.split_whitespace().map(String::from);
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            timeout,
        }
    }

    async fn run(&self, input: Vec<u8>) -> Result<ExecutionOutcome, ExecutorError> {
        if self.program.is_empty() {
            return Err(ExecutorError::Spawn("no executor command configured".into()));
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(ExecutionOutcome::failed(format!(
                "executor exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| ExecutorError::Protocol("executor produced no output".into()))?;
        serde_json::from_str(line).map_err(|e| ExecutorError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl BookingExecutor for CommandExecutor {
    async fn execute(
        &self,
        request: &BookingRequest,
        credentials: &Credentials,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let job = ExecutorJob {
            request_id: request.request_id.to_string(),
            user_id: &request.user_id,
            court: request.resource_id,
            date: request.booking_date.to_string(),
            time_slot: request.time_slot.to_string(),
            username: &credentials.username,
            password: &credentials.password,
        };
        let input = serde_json::to_vec(&job).map_err(|e| ExecutorError::Protocol(e.to_string()))?;
        debug!(request_id = %request.request_id, program = %self.program, "spawning executor");

        match tokio::time::timeout(self.timeout, self.run(input)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::BookingStatus;
    use crate::store::tests::sample;
    use chrono::NaiveDate;

    fn creds() -> Credentials {
        Credentials {
            username: "ana".into(),
            password: "pw".into(),
        }
    }

    fn request() -> BookingRequest {
        sample("ana", 1, NaiveDate::from_ymd_opt(2026, 4, 5).unwrap(), BookingStatus::Processing)
    }

    #[tokio::test]
    async fn parses_success_line() {
        let exec = CommandExecutor {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"cat >/dev/null; echo '{"success":true,"confirmation_code":"ABC"}'"#.into(),
            ],
            timeout: Duration::from_secs(5),
        };
        let outcome = exec.execute(&request(), &creds()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.confirmation_code.as_deref(), Some("ABC"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_outcome() {
        let exec = CommandExecutor {
            program: "sh".into(),
            args: vec!["-c".into(), "cat >/dev/null; echo slot taken >&2; exit 3".into()],
            timeout: Duration::from_secs(5),
        };
        let outcome = exec.execute(&request(), &creds()).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("slot taken"));
    }

    #[tokio::test]
    async fn garbage_output_is_protocol_error() {
        let exec = CommandExecutor {
            program: "sh".into(),
            args: vec!["-c".into(), "cat >/dev/null; echo not-json".into()],
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(
            exec.execute(&request(), &creds()).await,
            Err(ExecutorError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn slow_executor_times_out() {
        let exec = CommandExecutor {
            program: "sleep".into(),
            args: vec!["5".into()],
            timeout: Duration::from_millis(100),
        };
        assert!(matches!(
            exec.execute(&request(), &creds()).await,
            Err(ExecutorError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let exec = CommandExecutor::new("/definitely/not/here", Duration::from_secs(1));
        assert!(matches!(
            exec.execute(&request(), &creds()).await,
            Err(ExecutorError::Spawn(_))
        ));
    }
}
