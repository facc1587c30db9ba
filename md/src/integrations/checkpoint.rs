//! Checkpoint integration - durable snapshots at stage and cycle boundaries

use std::path::PathBuf;

use tracing::debug;

use crate::events::{Event, EventKind, IntegrationHandler, IntegrationPriority};

/// Writes a checkpoint JSON under `<mission_dir>/checkpoints/` when a
/// stage or cycle completes, so progress survives a crash between turns.
pub struct CheckpointIntegration {
    checkpoint_dir: PathBuf,
}

impl CheckpointIntegration {
    pub fn new(mission_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: mission_dir.into().join("checkpoints"),
        }
    }

    pub fn checkpoint_dir(&self) -> &PathBuf {
        &self.checkpoint_dir
    }
}

impl IntegrationHandler for CheckpointIntegration {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn priority(&self) -> IntegrationPriority {
        IntegrationPriority::High
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![EventKind::StageCompleted, EventKind::CycleCompleted]
    }

    fn handle_event(&self, event: &Event) -> eyre::Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;

        let filename = format!(
            "checkpoint-{}-{}-{}.json",
            event.kind.as_str(),
            event.stage,
            event.timestamp.format("%Y%m%dT%H%M%S%.3f")
        );
        let path = self.checkpoint_dir.join(filename);
        let json = serde_json::to_vec_pretty(event)?;
        std::fs::write(&path, json)?;

        debug!(path = %path.display(), "Checkpoint written");
        Ok(())
    }
}
