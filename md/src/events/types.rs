//! Event types for mission lifecycle streaming
//!
//! Every significant action in the engine emits one of these events:
//! - Stage lifecycle (started, completed, failed)
//! - Cycle lifecycle (started, completed)
//! - Mission lifecycle (started, completed, failed)
//! - Prompt/response traffic and state persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed vocabulary of lifecycle events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // === Stage lifecycle ===
    StageStarted,
    StageCompleted,
    StageFailed,

    // === Cycle lifecycle ===
    CycleStarted,
    CycleCompleted,

    // === Mission lifecycle ===
    MissionStarted,
    MissionCompleted,
    MissionFailed,

    // === Traffic ===
    ResponseReceived,
    PromptGenerated,

    // === State persistence ===
    StateSaved,
    StateLoaded,

    // === Integration-specific ===
    CheckpointCreated,
    SnapshotCreated,
    DriftDetected,
    LearningExtracted,
}

impl EventKind {
    /// Snake-case name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StageStarted => "stage_started",
            EventKind::StageCompleted => "stage_completed",
            EventKind::StageFailed => "stage_failed",
            EventKind::CycleStarted => "cycle_started",
            EventKind::CycleCompleted => "cycle_completed",
            EventKind::MissionStarted => "mission_started",
            EventKind::MissionCompleted => "mission_completed",
            EventKind::MissionFailed => "mission_failed",
            EventKind::ResponseReceived => "response_received",
            EventKind::PromptGenerated => "prompt_generated",
            EventKind::StateSaved => "state_saved",
            EventKind::StateLoaded => "state_loaded",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::SnapshotCreated => "snapshot_created",
            EventKind::DriftDetected => "drift_detected",
            EventKind::LearningExtracted => "learning_extracted",
        }
    }
}

/// Event value passed to integration handlers
///
/// Events are immutable after emission and shared by value: handlers
/// receive a reference and must not rely on seeing later mutations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Event type
    pub kind: EventKind,
    /// Stage the event relates to (canonical stage name)
    pub stage: String,
    /// Mission this event belongs to
    pub mission_id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Emitting component, e.g. "orchestrator", "cycle_manager"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Event-specific payload
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(kind: EventKind, stage: impl Into<String>, mission_id: impl Into<String>) -> Self {
        Self {
            kind,
            stage: stage.into(),
            mission_id: mission_id.into(),
            timestamp: Utc::now(),
            source: None,
            data: Map::new(),
        }
    }

    /// Attach a payload map
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Insert a single payload entry
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Record the emitting component
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::StageStarted.as_str(), "stage_started");
        assert_eq!(EventKind::MissionCompleted.as_str(), "mission_completed");
        assert_eq!(EventKind::LearningExtracted.as_str(), "learning_extracted");
    }

    #[test]
    fn test_event_kind_serde_round_trip() {
        let json = serde_json::to_string(&EventKind::CycleCompleted).unwrap();
        assert_eq!(json, "\"cycle_completed\"");
        let parsed: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, EventKind::CycleCompleted);
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventKind::StageCompleted, "PLANNING", "m1")
            .with_entry("status", json!("plan_complete"))
            .with_source("orchestrator");

        assert_eq!(event.kind, EventKind::StageCompleted);
        assert_eq!(event.stage, "PLANNING");
        assert_eq!(event.mission_id, "m1");
        assert_eq!(event.source.as_deref(), Some("orchestrator"));
        assert_eq!(event.data.get("status"), Some(&json!("plan_complete")));
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(EventKind::CheckpointCreated, "BUILDING", "m2");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("checkpoint_created"));
        assert!(json.contains("BUILDING"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, EventKind::CheckpointCreated);
        assert_eq!(parsed.mission_id, "m2");
    }
}
