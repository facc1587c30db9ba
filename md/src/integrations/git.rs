//! Git integration - checkpoint commits at mission milestones

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{Event, EventKind, IntegrationHandler, IntegrationPriority};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates git commits at checkpoints during mission execution
///
/// Commits after BUILDING stage completion, at each cycle end, and at
/// mission end. Unavailable when git is not installed or the probe
/// times out.
pub struct GitIntegration {
    workspace_dir: PathBuf,
    available: bool,
}

impl GitIntegration {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        let available = run_with_timeout(
            Command::new("git").arg("--version"),
            AVAILABILITY_TIMEOUT,
        )
        .map(|out| out.status.success())
        .unwrap_or(false);

        if !available {
            warn!("git not available, checkpoint commits disabled");
        }

        Self {
            workspace_dir: workspace_dir.into(),
            available,
        }
    }

    fn commit_checkpoint(&self, message: &str, files: &[String]) -> eyre::Result<bool> {
        // Stage the named files, or everything when none are named
        if files.is_empty() {
            self.git(&["add", "-A"])?;
        } else {
            for file in files {
                if let Err(e) = self.git(&["add", file.as_str()]) {
                    debug!(%file, error = %e, "git add failed, continuing");
                }
            }
        }

        let status = self.git(&["status", "--porcelain"])?;
        if status.stdout.is_empty() {
            debug!("No changes to commit");
            return Ok(false);
        }

        let commit = self.git(&["commit", "-m", message])?;
        if commit.status.success() {
            debug!(%message, "Checkpoint commit created");
            Ok(true)
        } else {
            warn!(stderr = %String::from_utf8_lossy(&commit.stderr), "git commit failed");
            Ok(false)
        }
    }

    fn git(&self, args: &[&str]) -> eyre::Result<Output> {
        run_with_timeout(
            Command::new("git").args(args).current_dir(&self.workspace_dir),
            GIT_TIMEOUT,
        )
    }

    fn event_files(event: &Event) -> Vec<String> {
        let mut files = Vec::new();
        for key in ["files_created", "files_modified"] {
            if let Some(Value::Array(items)) = event.data.get(key) {
                files.extend(items.iter().filter_map(|v| v.as_str().map(|s| s.to_string())));
            }
        }
        files
    }
}

/// Run a command with a hard deadline
///
/// Polls the child and kills it when the deadline passes, so a wedged
/// git (lock contention, hung hook) cannot stall the event bus.
fn run_with_timeout(command: &mut Command, timeout: Duration) -> eyre::Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_) => return Ok(child.wait_with_output()?),
            None if Instant::now() >= deadline => {
                warn!(?timeout, "Subprocess deadline passed, killing");
                let _ = child.kill();
                let _ = child.wait();
                eyre::bail!("subprocess timed out after {timeout:?}");
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

impl IntegrationHandler for GitIntegration {
    fn name(&self) -> &str {
        "git"
    }

    fn priority(&self) -> IntegrationPriority {
        IntegrationPriority::Normal
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::StageCompleted,
            EventKind::CycleCompleted,
            EventKind::MissionCompleted,
        ]
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn handle_event(&self, event: &Event) -> eyre::Result<()> {
        match event.kind {
            EventKind::StageCompleted if event.stage == "BUILDING" => {
                let files = Self::event_files(event);
                self.commit_checkpoint(&format!("Build checkpoint - {}", event.mission_id), &files)?;
            }
            EventKind::CycleCompleted => {
                let cycle = event.data.get("cycle_number").and_then(Value::as_u64).unwrap_or(0);
                self.commit_checkpoint(&format!("Cycle {cycle} complete - {}", event.mission_id), &[])?;
            }
            EventKind::MissionCompleted => {
                self.commit_checkpoint(&format!("Mission complete - {}", event.mission_id), &[])?;
            }
            _ => {}
        }
        Ok(())
    }
}
