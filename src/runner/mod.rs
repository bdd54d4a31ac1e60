//! Process runner
//!
//! Spawns the CLI for one turn, enforces the complexity-based timeout and
//! hands stdout to the output processor.

pub mod executable;
pub mod output;
pub mod timeout;

pub use executable::resolve_executable;
pub use output::{
    classify_error, extract_error, process_output, process_streaming_response, ExtractedError,
    StreamMetadata, ToolUse, TurnResult, Usage,
};
pub use timeout::calculate_timeout_for_command;

use crate::config::Config;
use crate::error::{ProcessError, ProcessErrorKind};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// One turn to execute
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub request_id: String,
    pub prompt: String,
    pub project_path: String,
    /// External handle to resume, if the conversation already has one
    pub claude_session_id: Option<String>,
}

pub struct ProcessRunner {
    executable: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(executable: PathBuf, extra_args: Vec<String>) -> Self {
        Self {
            executable,
            extra_args,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let executable = resolve_executable(config.claude_path.as_deref());
        tracing::info!("Using CLI executable: {}", executable.display());
        Self::new(executable, config.claude_args.clone())
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Arguments for one turn; the prompt itself goes over stdin
    pub fn build_args(&self, request: &TurnRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(id) = request.claude_session_id.as_deref().filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Run a turn with the timeout derived from its text
    pub async fn run_turn(&self, request: &TurnRequest) -> Result<TurnResult, ProcessError> {
        let timeout = calculate_timeout_for_command(&request.prompt);
        self.run_with_timeout(request, timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        request: &TurnRequest,
        timeout: Duration,
    ) -> Result<TurnResult, ProcessError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(self.build_args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let project = Path::new(&request.project_path);
        if !request.project_path.is_empty() && project.is_dir() {
            cmd.current_dir(project);
        }

        tracing::info!(
            "Running turn {} for session {} (timeout {}s)",
            request.request_id,
            request.session_id,
            timeout.as_secs()
        );

        let mut child = cmd.spawn().map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProcessErrorKind::PermissionDenied
            } else {
                ProcessErrorKind::Unknown
            };
            ProcessError::new(
                kind,
                format!("Failed to start {}: {}", self.executable.display(), e),
            )
        })?;

        let stdin = child.stdin.take();
        let prompt = request.prompt.as_bytes();
        let write_prompt = async move {
            if let Some(mut stdin) = stdin {
                // A CLI that exits without reading stdin closes the pipe early
                if let Err(e) = stdin.write_all(prompt).await {
                    tracing::debug!("Could not write prompt to stdin: {}", e);
                }
                let _ = stdin.shutdown().await;
            }
        };
        // The prompt write and output collection share one deadline. Dropping
        // the future on timeout drops the child, which kills it.
        let turn = async move {
            let (_, output) = tokio::join!(write_prompt, child.wait_with_output());
            output
        };
        let output = match tokio::time::timeout(timeout, turn).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProcessError::new(
                    ProcessErrorKind::Unknown,
                    format!("Failed to collect CLI output: {}", e),
                ))
            }
            Err(_) => {
                tracing::warn!(
                    "Turn {} for session {} timed out after {}s",
                    request.request_id,
                    request.session_id,
                    timeout.as_secs()
                );
                return Err(ProcessError::new(
                    ProcessErrorKind::Timeout,
                    format!("Claude did not respond within {} seconds", timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let extracted = extract_error(&stderr).or_else(|| extract_error(&stdout));
            if let Some(err) = extracted {
                tracing::warn!(
                    "Turn {} failed ({}): {}",
                    request.request_id,
                    err.kind.as_str(),
                    err.message
                );
                return Err(ProcessError::new(err.kind, err.message));
            }
            if stdout.trim().is_empty() {
                let detail = output::clean_text(&stderr);
                return Err(ProcessError::new(
                    classify_error(&detail),
                    format!("CLI exited with {}: {}", output.status, detail),
                ));
            }
        }

        let result = process_output(&stdout, &request.session_id, Some(&request.request_id))?;
        if !result.success {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "No valid response from Claude".to_string());
            return Err(ProcessError::new(classify_error(&message), message));
        }
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(prompt: &str, resume: Option<&str>) -> TurnRequest {
        TurnRequest {
            session_id: "s1".to_string(),
            request_id: "r1".to_string(),
            prompt: prompt.to_string(),
            project_path: String::new(),
            claude_session_id: resume.map(str::to_string),
        }
    }

    #[test]
    fn resume_flag_only_with_handle() {
        let runner = ProcessRunner::new(PathBuf::from("claude"), vec!["--model".into(), "x".into()]);
        let fresh = runner.build_args(&request("hi", None));
        assert!(!fresh.contains(&"--resume".to_string()));
        assert_eq!(fresh.last().map(String::as_str), Some("x"));

        let resumed = runner.build_args(&request("hi", Some("abc")));
        let pos = resumed.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(resumed[pos + 1], "abc");
    }

    #[tokio::test]
    async fn streams_prompt_and_parses_output() {
        let dir = TempDir::new().unwrap();
        let exe = script(
            &dir,
            "fake-claude",
            r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"ext-1"}'
printf '{"type":"result","subtype":"success","result":"echo: %s","session_id":"ext-1"}\n' "$prompt""#,
        );
        let runner = ProcessRunner::new(exe, Vec::new());
        let result = runner.run_turn(&request("ping", None)).await.unwrap();
        assert_eq!(result.response, "echo: ping");
        assert_eq!(result.claude_session_id.as_deref(), Some("ext-1"));
        assert_eq!(result.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn slow_cli_times_out() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "slow-claude", "sleep 5");
        let runner = ProcessRunner::new(exe, Vec::new());
        let err = runner
            .run_with_timeout(&request("hi", None), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProcessErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unread_large_prompt_still_times_out() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "deaf-claude", "sleep 5");
        let runner = ProcessRunner::new(exe, Vec::new());
        let prompt = "x".repeat(1024 * 1024);

        let started = std::time::Instant::now();
        let err = runner
            .run_with_timeout(&request(&prompt, None), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProcessErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failing_cli_is_classified() {
        let dir = TempDir::new().unwrap();
        let exe = script(
            &dir,
            "limited-claude",
            "echo 'Error: rate_limit_error: too many requests' >&2\nexit 1",
        );
        let runner = ProcessRunner::new(exe, Vec::new());
        let err = runner.run_turn(&request("hi", None)).await.unwrap_err();
        assert_eq!(err.kind, ProcessErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let runner = ProcessRunner::new(PathBuf::from("/nonexistent/claude"), Vec::new());
        let err = runner.run_turn(&request("hi", None)).await.unwrap_err();
        assert!(err.message.contains("Failed to start"));
    }
}
