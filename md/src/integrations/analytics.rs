//! Analytics integration - event counters and a JSONL event log

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::json;
use tracing::debug;

use crate::events::{Event, EventKind, IntegrationHandler, IntegrationPriority};

/// Counts events per kind and appends them to a JSONL log
///
/// Runs at CRITICAL priority so every event is recorded before other
/// integrations react to it.
pub struct AnalyticsIntegration {
    log_path: Option<PathBuf>,
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl AnalyticsIntegration {
    /// Counters only, no log file
    pub fn new() -> Self {
        Self {
            log_path: None,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Counters plus a JSONL event log at the given path
    pub fn with_log(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: Some(log_path.into()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of per-kind event counts
    pub fn counts(&self) -> HashMap<&'static str, u64> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Count for a single event kind
    pub fn count_of(&self, kind: EventKind) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind.as_str())
            .copied()
            .unwrap_or(0)
    }
}

impl Default for AnalyticsIntegration {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrationHandler for AnalyticsIntegration {
    fn name(&self) -> &str {
        "analytics"
    }

    fn priority(&self) -> IntegrationPriority {
        IntegrationPriority::Critical
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::StageStarted,
            EventKind::StageCompleted,
            EventKind::StageFailed,
            EventKind::CycleStarted,
            EventKind::CycleCompleted,
            EventKind::MissionStarted,
            EventKind::MissionCompleted,
            EventKind::MissionFailed,
            EventKind::ResponseReceived,
            EventKind::PromptGenerated,
        ]
    }

    fn handle_event(&self, event: &Event) -> eyre::Result<()> {
        {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(event.kind.as_str()).or_insert(0) += 1;
        }

        if let Some(path) = &self.log_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let line = json!({
                "ts": event.timestamp,
                "kind": event.kind.as_str(),
                "stage": event.stage,
                "mission_id": event.mission_id,
            });
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{line}")?;
            debug!(path = %path.display(), kind = event.kind.as_str(), "Logged event");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_counts_events() {
        let analytics = AnalyticsIntegration::new();
        let event = Event::new(EventKind::StageCompleted, "PLANNING", "m1");
        analytics.handle_event(&event).unwrap();
        analytics.handle_event(&event).unwrap();

        assert_eq!(analytics.count_of(EventKind::StageCompleted), 2);
        assert_eq!(analytics.count_of(EventKind::CycleStarted), 0);
    }

    #[test]
    fn test_appends_jsonl_log() {
        let temp = tempdir().unwrap();
        let log = temp.path().join("events.jsonl");
        let analytics = AnalyticsIntegration::with_log(&log);

        analytics
            .handle_event(&Event::new(EventKind::MissionStarted, "PLANNING", "m1"))
            .unwrap();
        analytics
            .handle_event(&Event::new(EventKind::StageStarted, "PLANNING", "m1"))
            .unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("mission_started"));
        assert!(lines[1].contains("stage_started"));

        // Every line is valid JSON
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn test_priority_is_critical() {
        assert_eq!(AnalyticsIntegration::new().priority(), IntegrationPriority::Critical);
    }
}
