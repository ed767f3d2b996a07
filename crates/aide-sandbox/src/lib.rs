use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_runtime_secs: u64,
    pub max_output_chars: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_runtime_secs: 30,
            max_output_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub limits: SandboxLimits,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            limits: SandboxLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellExecution {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub max_runtime_secs: u64,
    pub max_output_chars: usize,
}

impl ShellExecution {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Text handed back to the model: stdout, then stderr tagged, else the
    /// exit code. Non-zero exits still return whatever was captured.
    pub fn render(&self) -> String {
        if self.timed_out {
            return format!("Error: command timed out ({}s).", self.max_runtime_secs);
        }

        let out = self.stdout.trim();
        let err = self.stderr.trim();
        let mut result = out.to_owned();
        if !err.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str("[stderr]: ");
            result.push_str(err);
        }
        if result.is_empty() {
            result = match self.exit_code {
                Some(code) => format!("(exit code {code})"),
                None => "(terminated by signal)".to_owned(),
            };
        }
        truncate_chars(&result, self.max_output_chars)
    }
}

/// Cuts `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_owned(),
        None => text.to_owned(),
    }
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, request: ShellRequest) -> Result<ShellExecution>;
}

/// Runs commands through `sh -c` on the local host.
#[derive(Debug, Clone)]
pub struct LocalSandboxRunner {
    pub shell: String,
}

impl Default for LocalSandboxRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_owned(),
        }
    }
}

impl LocalSandboxRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl SandboxRunner for LocalSandboxRunner {
    #[instrument(
        skip(self, request),
        fields(command = %request.command, cwd = %request.cwd.display())
    )]
    async fn run(&self, request: ShellRequest) -> Result<ShellExecution> {
        let started_at = Utc::now();

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.cwd)
            .kill_on_drop(true);

        let limit = Duration::from_secs(request.limits.max_runtime_secs.max(1));
        let finished = timeout(limit, command.output()).await;
        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds();

        match finished {
            Ok(output) => {
                let output = output
                    .with_context(|| format!("failed to spawn {} -c", self.shell))?;
                let execution = ShellExecution {
                    started_at,
                    ended_at,
                    duration_ms,
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                    max_runtime_secs: request.limits.max_runtime_secs,
                    max_output_chars: request.limits.max_output_chars,
                };
                debug!(
                    exit_code = ?execution.exit_code,
                    duration_ms,
                    "shell command finished"
                );
                Ok(execution)
            }
            Err(_) => {
                warn!(
                    max_runtime_secs = request.limits.max_runtime_secs,
                    "shell command timed out and was killed"
                );
                Ok(ShellExecution {
                    started_at,
                    ended_at,
                    duration_ms,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                    max_runtime_secs: request.limits.max_runtime_secs,
                    max_output_chars: request.limits.max_output_chars,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn runs_in_requested_directory() -> Result<()> {
        let root = unique_test_root("aide-sandbox");
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::write(root.join("marker.txt"), "x").await?;

        let runner = LocalSandboxRunner::default();
        let execution = runner.run(ShellRequest::new("ls", &root)).await?;
        assert!(execution.success());
        assert!(execution.render().contains("marker.txt"));

        tokio::fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn stderr_and_exit_codes_are_reported() -> Result<()> {
        let runner = LocalSandboxRunner::default();
        let cwd = std::env::temp_dir();

        let mixed = runner
            .run(ShellRequest::new("echo out; echo err 1>&2; exit 3", &cwd))
            .await?;
        assert_eq!(mixed.exit_code, Some(3));
        assert!(!mixed.success());
        assert_eq!(mixed.render(), "out\n[stderr]: err");

        let silent = runner.run(ShellRequest::new("exit 7", &cwd)).await?;
        assert_eq!(silent.render(), "(exit code 7)");
        Ok(())
    }

    #[tokio::test]
    async fn slow_commands_time_out() -> Result<()> {
        let runner = LocalSandboxRunner::default();
        let request = ShellRequest::new("sleep 5", std::env::temp_dir()).with_limits(SandboxLimits {
            max_runtime_secs: 1,
            max_output_chars: 2000,
        });

        let execution = runner.run(request).await?;
        assert!(execution.timed_out);
        assert!(execution.duration_ms < 4000);
        assert_eq!(execution.render(), "Error: command timed out (1s).");
        Ok(())
    }

    #[tokio::test]
    async fn output_is_truncated_to_the_character_budget() -> Result<()> {
        let runner = LocalSandboxRunner::default();
        let request = ShellRequest::new("printf 'abcdefghij'", std::env::temp_dir())
            .with_limits(SandboxLimits {
                max_runtime_secs: 5,
                max_output_chars: 4,
            });
        assert_eq!(runner.run(request).await?.render(), "abcd");
        Ok(())
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
