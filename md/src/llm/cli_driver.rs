//! CLI subprocess LLM driver
//!
//! Spawns the configured agent CLI, feeds the prompt on stdin, and
//! collects stdout. Timeouts kill the child; the emergency path sends
//! SIGTERM and escalates to SIGKILL after a grace period.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{LlmDriver, LlmInvocation};

const KILL_GRACE: Duration = Duration::from_secs(5);
const STDERR_SNIPPET: usize = 200;

/// Drives an external agent CLI as a subprocess
pub struct CliDriver {
    command: String,
    args: Vec<String>,
    /// pid of the in-flight child, 0 when idle
    current_pid: Arc<AtomicI32>,
}

impl CliDriver {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            current_pid: Arc::new(AtomicI32::new(0)),
        }
    }

    fn snippet(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).chars().take(STDERR_SNIPPET).collect()
    }
}

#[async_trait]
impl LlmDriver for CliDriver {
    async fn invoke(&self, prompt: &str, timeout: Duration) -> LlmInvocation {
        debug!(command = %self.command, ?timeout, prompt_chars = prompt.len(), "CliDriver::invoke");

        let mut child = match Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return LlmInvocation::failed(format!("exception:{e}")),
        };

        self.current_pid
            .store(child.id().map(|id| id as i32).unwrap_or(0), Ordering::SeqCst);

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                self.current_pid.store(0, Ordering::SeqCst);
                return LlmInvocation::failed(format!("exception:{e}"));
            }
            // Close stdin so the CLI knows the prompt is complete
            drop(stdin);
        }

        // Drain pipes concurrently so a chatty child cannot block on a
        // full pipe while we wait for exit
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.current_pid.store(0, Ordering::SeqCst);
                return LlmInvocation::failed(format!("exception:{e}"));
            }
            Err(_) => {
                warn!(?timeout, "LLM CLI timed out, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.current_pid.store(0, Ordering::SeqCst);
                return LlmInvocation::failed(format!("timeout:{}s", timeout.as_secs()));
            }
        };

        self.current_pid.store(0, Ordering::SeqCst);

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            LlmInvocation::ok(String::from_utf8_lossy(&stdout).into_owned())
        } else {
            LlmInvocation::failed(format!("cli_error:{}", Self::snippet(&stderr)))
        }
    }

    /// SIGTERM the in-flight child, escalating to SIGKILL after a grace
    /// period if it is still alive
    fn kill_in_flight(&self) {
        let pid = self.current_pid.load(Ordering::SeqCst);
        if pid == 0 {
            debug!("kill_in_flight: no child in flight");
            return;
        }

        info!(pid, "Killing in-flight LLM process");
        let target = Pid::from_raw(pid);
        if let Err(e) = kill(target, Signal::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM failed");
            return;
        }

        let current = self.current_pid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            // Escalate only if the same child is still in flight
            if current.load(Ordering::SeqCst) == pid {
                warn!(pid, "Grace period expired, sending SIGKILL");
                let _ = kill(target, Signal::SIGKILL);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_invocation_returns_stdout() {
        let driver = CliDriver::new("cat", vec![]);
        let outcome = driver.invoke("hello prompt", Duration::from_secs(5)).await;
        assert!(!outcome.is_error());
        assert_eq!(outcome.text.as_deref(), Some("hello prompt"));
    }

    #[tokio::test]
    async fn test_timeout_produces_timeout_error() {
        let driver = CliDriver::new("sleep", vec!["30".to_string()]);
        let outcome = driver.invoke("", Duration::from_millis(200)).await;
        assert!(outcome.is_error());
        assert_eq!(outcome.error, "timeout:0s");
    }

    #[tokio::test]
    async fn test_missing_binary_is_exception() {
        let driver = CliDriver::new("definitely-not-a-real-binary-xyz", vec![]);
        let outcome = driver.invoke("", Duration::from_secs(1)).await;
        assert!(outcome.is_error());
        assert!(outcome.error.starts_with("exception:"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_cli_error() {
        let driver = CliDriver::new("sh", vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()]);
        let outcome = driver.invoke("", Duration::from_secs(5)).await;
        assert!(outcome.is_error());
        assert!(outcome.error.starts_with("cli_error:"));
        assert!(outcome.error.contains("oops"));
    }

    #[tokio::test]
    async fn test_kill_in_flight_idle_is_noop() {
        let driver = CliDriver::new("cat", vec![]);
        driver.kill_in_flight();
    }
}
