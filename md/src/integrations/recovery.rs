//! Recovery integration - crash heartbeat and resume context

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{Event, EventKind, IntegrationHandler, IntegrationPriority};

/// Crash-recovery record injected into the first prompt after a restart
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub mission_id: String,
    pub stage: String,
    pub iteration: u32,
    pub cycle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Heartbeat {
    #[serde(flatten)]
    info: RecoveryInfo,
    clean_shutdown: bool,
}

/// Maintains a heartbeat file so a crashed run can be resumed
///
/// The heartbeat is refreshed on every stage start and marked clean when
/// the mission completes. [`RecoveryIntegration::recovery_info`] returns
/// a record only when a previous run left an unclean heartbeat behind.
pub struct RecoveryIntegration {
    heartbeat_path: PathBuf,
    /// Recovery record captured from the previous run at construction
    prior: Mutex<Option<RecoveryInfo>>,
}

impl RecoveryIntegration {
    pub fn new(mission_dir: impl Into<PathBuf>) -> Self {
        let heartbeat_path = mission_dir.into().join("recovery.json");
        let prior = Self::read_unclean(&heartbeat_path);
        if prior.is_some() {
            warn!(path = %heartbeat_path.display(), "Previous run left an unclean heartbeat, recovery context available");
        }
        Self {
            heartbeat_path,
            prior: Mutex::new(prior),
        }
    }

    fn read_unclean(path: &PathBuf) -> Option<RecoveryInfo> {
        let content = std::fs::read_to_string(path).ok()?;
        let heartbeat: Heartbeat = serde_json::from_str(&content).ok()?;
        if heartbeat.clean_shutdown {
            None
        } else {
            Some(heartbeat.info)
        }
    }

    /// The crash record from the previous run, if any
    ///
    /// Cleared once consumed so the recovery block is injected exactly
    /// once per restart.
    pub fn recovery_info(&self) -> Option<RecoveryInfo> {
        self.prior.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn write_heartbeat(&self, event: &Event, clean: bool) -> eyre::Result<()> {
        let info = RecoveryInfo {
            mission_id: event.mission_id.clone(),
            stage: event.stage.clone(),
            iteration: event
                .data
                .get("iteration")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            cycle: event.data.get("cycle").and_then(Value::as_u64).unwrap_or(1) as u32,
            progress: event
                .data
                .get("status")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
        };

        if let Some(parent) = self.heartbeat_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let heartbeat = Heartbeat {
            info,
            clean_shutdown: clean,
        };
        std::fs::write(&self.heartbeat_path, serde_json::to_vec_pretty(&heartbeat)?)?;
        debug!(path = %self.heartbeat_path.display(), clean, "Heartbeat written");
        Ok(())
    }
}

impl IntegrationHandler for RecoveryIntegration {
    fn name(&self) -> &str {
        "recovery"
    }

    fn priority(&self) -> IntegrationPriority {
        IntegrationPriority::High
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::StageStarted,
            EventKind::StageCompleted,
            EventKind::MissionCompleted,
        ]
    }

    fn handle_event(&self, event: &Event) -> eyre::Result<()> {
        let clean = event.kind == EventKind::MissionCompleted;
        self.write_heartbeat(event, clean)
    }
}
