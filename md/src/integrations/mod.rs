//! Built-in integration handlers for cross-cutting concerns
//!
//! Each integration subscribes to lifecycle events on the bus and stays
//! out of the orchestrator's way: failures are logged and counted by the
//! bus, never propagated.

mod analytics;
mod checkpoint;
mod git;
mod recovery;

pub use analytics::AnalyticsIntegration;
pub use checkpoint::CheckpointIntegration;
pub use git::GitIntegration;
pub use recovery::{RecoveryInfo, RecoveryIntegration};

use std::path::Path;
use std::sync::Arc;

use crate::events::IntegrationBus;

/// Register the default integration set on a bus
///
/// Returns the recovery handle so the orchestrator can inject crash
/// context into prompts.
pub fn register_defaults(bus: &IntegrationBus, mission_dir: &Path, workspace_dir: &Path) -> Arc<RecoveryIntegration> {
    let recovery = Arc::new(RecoveryIntegration::new(mission_dir));
    bus.register(Arc::new(AnalyticsIntegration::with_log(
        mission_dir.join("events.jsonl"),
    )));
    bus.register(Arc::new(CheckpointIntegration::new(mission_dir)));
    bus.register(recovery.clone());
    bus.register(Arc::new(GitIntegration::new(workspace_dir)));
    recovery
}
