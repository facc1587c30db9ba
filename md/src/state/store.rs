//! StateStore - loads, mutates, and atomically persists the mission record
//!
//! The store is the single writer of the mission JSON on disk. Reads go
//! through the cached in-memory record; every mutation stamps
//! `last_updated` and, with auto-save on, flushes via an atomic
//! write-temp-then-rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::stages::Stage;

use super::record::{CycleSummary, HistoryEntry, MissionRecord};

/// Errors from state persistence
///
/// Loads never fail - a missing or malformed file degrades to the
/// default record. Write errors always propagate: loss of persistence
/// is not silently tolerated.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to write mission state: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to serialize mission state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Mission state persistence
pub struct StateStore {
    path: PathBuf,
    auto_save: bool,
    mission: Option<MissionRecord>,
}

impl StateStore {
    /// Create a store with auto-save enabled
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_auto_save(path, true)
    }

    /// Create a store, choosing whether mutations flush immediately
    pub fn with_auto_save(path: impl Into<PathBuf>, auto_save: bool) -> Self {
        let path = path.into();
        debug!(path = %path.display(), auto_save, "StateStore::new");
        Self {
            path,
            auto_save,
            mission: None,
        }
    }

    /// Path of the backing JSON document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the mission from disk, replacing the cached record
    ///
    /// A missing file materializes the default record; malformed JSON is
    /// logged and also degrades to the default.
    pub fn load(&mut self) -> &MissionRecord {
        let record = match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<MissionRecord>(&content) {
                Ok(record) => {
                    debug!(path = %self.path.display(), "Loaded mission");
                    record
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Malformed mission file, using defaults");
                    MissionRecord::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No mission file, using defaults");
                MissionRecord::default()
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read mission file, using defaults");
                MissionRecord::default()
            }
        };

        self.mission = Some(record);
        self.mission.as_ref().unwrap_or_else(|| unreachable!())
    }

    /// Cached view of the mission, loading on first access
    pub fn mission(&mut self) -> &MissionRecord {
        if self.mission.is_none() {
            self.load();
        }
        self.mission.as_ref().unwrap_or_else(|| unreachable!())
    }

    fn mission_mut(&mut self) -> &mut MissionRecord {
        if self.mission.is_none() {
            self.load();
        }
        self.mission.as_mut().unwrap_or_else(|| unreachable!())
    }

    /// Replace the whole record (mission creation, explicit reset)
    pub fn set_mission(&mut self, record: MissionRecord) -> Result<(), StateError> {
        self.mission = Some(record);
        self.persist()
    }

    /// Persist the cached record now, regardless of auto-save
    pub fn save(&mut self) -> Result<(), StateError> {
        self.mission_mut().last_updated = Utc::now();
        let record = self.mission.as_ref().unwrap_or_else(|| unreachable!());
        let json = serde_json::to_vec_pretty(record)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        // write(tmp) -> fsync -> rename(tmp, target)
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "Saved mission");
        Ok(())
    }

    fn persist(&mut self) -> Result<(), StateError> {
        if self.auto_save {
            self.save()
        } else {
            self.mission_mut().last_updated = Utc::now();
            Ok(())
        }
    }

    // === Field access ===

    /// Read a mission field by key, covering the named fields and `extra`
    pub fn get_field(&mut self, key: &str) -> Option<Value> {
        let m = self.mission();
        match key {
            "mission_id" => Some(Value::String(m.mission_id.clone())),
            "problem_statement" => Some(Value::String(m.problem_statement.clone())),
            "original_problem_statement" => m
                .original_problem_statement
                .as_ref()
                .map(|s| Value::String(s.clone())),
            "current_stage" => Some(Value::String(m.current_stage.to_string())),
            "iteration" => Some(Value::from(m.iteration)),
            "max_iterations" => Some(Value::from(m.max_iterations)),
            "current_cycle" => Some(Value::from(m.current_cycle)),
            "cycle_budget" => Some(Value::from(m.cycle_budget)),
            "success_criteria" => serde_json::to_value(&m.success_criteria).ok(),
            "preferences" => Some(Value::Object(m.preferences.clone())),
            "mission_workspace" => m
                .mission_workspace
                .as_ref()
                .map(|p| Value::String(p.display().to_string())),
            "mission_dir" => m.mission_dir.as_ref().map(|p| Value::String(p.display().to_string())),
            _ => m.extra.get(key).cloned(),
        }
    }

    /// Set a mission field by key
    ///
    /// Named fields are converted to their typed form; unknown keys land
    /// in the pass-through map. A type mismatch on a named field is a
    /// serialization error.
    pub fn set_field(&mut self, key: &str, value: Value) -> Result<(), StateError> {
        {
            let m = self.mission_mut();
            match key {
                "problem_statement" => m.problem_statement = serde_json::from_value(value)?,
                "original_problem_statement" => m.original_problem_statement = serde_json::from_value(value)?,
                "iteration" => m.iteration = serde_json::from_value(value)?,
                "max_iterations" => m.max_iterations = serde_json::from_value(value)?,
                "current_cycle" => m.current_cycle = serde_json::from_value(value)?,
                "cycle_budget" => m.cycle_budget = serde_json::from_value(value)?,
                "success_criteria" => m.success_criteria = serde_json::from_value(value)?,
                "preferences" => m.preferences = serde_json::from_value(value)?,
                "mission_workspace" => m.mission_workspace = serde_json::from_value(value)?,
                "mission_dir" => m.mission_dir = serde_json::from_value(value)?,
                _ => {
                    m.extra.insert(key.to_string(), value);
                }
            }
        }
        self.persist()
    }

    // === Mutation operations ===

    /// Append an entry to the mission history
    pub fn log_history(&mut self, entry: &str, details: Option<Value>) -> Result<(), StateError> {
        {
            let m = self.mission_mut();
            let history_entry = HistoryEntry {
                timestamp: Utc::now(),
                stage: m.current_stage,
                event: entry.to_string(),
                details,
            };
            m.history.push(history_entry);
        }
        self.persist()
    }

    /// Increment the iteration counter, returning the new value
    pub fn increment_iteration(&mut self) -> Result<u32, StateError> {
        let new = {
            let m = self.mission_mut();
            m.iteration += 1;
            m.iteration
        };
        debug!(iteration = new, "Incremented iteration");
        self.persist()?;
        Ok(new)
    }

    /// Record the completed cycle and advance to the next one
    ///
    /// Appends a cycle summary, resets the iteration counter, and bumps
    /// `current_cycle`. Returns the new cycle number.
    pub fn advance_cycle(&mut self, continuation_prompt: &str) -> Result<u32, StateError> {
        let new_cycle = {
            let m = self.mission_mut();
            let summary = CycleSummary {
                cycle: m.current_cycle,
                completed_at: Utc::now(),
                iteration_count: m.iteration,
                continuation_prompt: continuation_prompt.to_string(),
                status: "completed".to_string(),
                summary: String::new(),
            };
            m.cycle_history.push(summary);
            m.current_cycle += 1;
            m.iteration = 0;
            m.problem_statement = continuation_prompt.to_string();
            m.current_cycle
        };
        info!(cycle = new_cycle, "Advanced to next cycle");
        self.persist()?;
        Ok(new_cycle)
    }

    /// Record the latest cycle's outcome in its summary
    pub fn annotate_last_cycle(&mut self, status: &str, summary: &str) -> Result<(), StateError> {
        {
            let m = self.mission_mut();
            if let Some(last) = m.cycle_history.last_mut() {
                last.status = status.to_string();
                last.summary = summary.to_string();
            } else {
                warn!("No cycle history to annotate");
            }
        }
        self.persist()
    }

    /// Transition to a new stage, returning the old one
    ///
    /// Also appends a transition entry to the history.
    pub fn update_stage(&mut self, new_stage: Stage) -> Result<Stage, StateError> {
        let old = {
            let m = self.mission_mut();
            let old = m.current_stage;
            m.current_stage = new_stage;
            old
        };
        self.log_history(&format!("Stage transition: {old} -> {new_stage}"), None)?;
        Ok(old)
    }

    // === Workspace path helpers ===

    /// The mission workspace directory
    pub fn workspace_dir(&mut self) -> PathBuf {
        self.mission()
            .mission_workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }

    pub fn artifacts_dir(&mut self) -> PathBuf {
        self.workspace_dir().join("artifacts")
    }

    pub fn research_dir(&mut self) -> PathBuf {
        self.workspace_dir().join("research")
    }

    pub fn tests_dir(&mut self) -> PathBuf {
        self.workspace_dir().join("tests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("mission.json"))
    }

    #[test]
    fn test_missing_file_yields_default() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);
        let mission = store.mission();
        assert_eq!(mission.mission_id, "default");
        assert_eq!(mission.current_stage, Stage::Planning);
    }

    #[test]
    fn test_malformed_file_yields_default() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("mission.json");
        fs::write(&path, "{not json").unwrap();

        let mut store = StateStore::new(&path);
        let mission = store.load();
        assert_eq!(mission.mission_id, "default");
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("mission.json");

        let mut store = StateStore::new(&path);
        let mut record = MissionRecord::default();
        record.mission_id = "m1".to_string();
        record.problem_statement = "build a parser".to_string();
        store.set_mission(record).unwrap();

        let mut fresh = StateStore::new(&path);
        let mission = fresh.load();
        assert_eq!(mission.mission_id, "m1");
        assert_eq!(mission.problem_statement, "build a parser");
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);
        store.save().unwrap();

        let entries: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("mission.json")]);
    }

    #[test]
    fn test_update_stage_logs_history_and_stamps() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);
        let before = store.mission().last_updated;

        std::thread::sleep(std::time::Duration::from_millis(5));
        let old = store.update_stage(Stage::Building).unwrap();
        assert_eq!(old, Stage::Planning);

        let mission = store.mission();
        assert_eq!(mission.current_stage, Stage::Building);
        assert!(mission.last_updated > before);
        assert_eq!(mission.history.len(), 1);
        assert!(mission.history[0].event.contains("PLANNING -> BUILDING"));
    }

    #[test]
    fn test_increment_iteration() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);
        assert_eq!(store.increment_iteration().unwrap(), 1);
        assert_eq!(store.increment_iteration().unwrap(), 2);
        assert_eq!(store.mission().iteration, 2);
    }

    #[test]
    fn test_advance_cycle_resets_iteration() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);
        store.set_field("cycle_budget", serde_json::json!(3)).unwrap();
        store.increment_iteration().unwrap();
        store.increment_iteration().unwrap();

        let new_cycle = store.advance_cycle("Continue with phase two").unwrap();
        assert_eq!(new_cycle, 2);

        let mission = store.mission();
        assert_eq!(mission.iteration, 0);
        assert_eq!(mission.current_cycle, 2);
        assert_eq!(mission.cycle_history.len(), 1);
        assert_eq!(mission.cycle_history[0].iteration_count, 2);
        assert_eq!(mission.cycle_history[0].continuation_prompt, "Continue with phase two");
        assert_eq!(mission.problem_statement, "Continue with phase two");
    }

    #[test]
    fn test_get_set_field() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);

        store
            .set_field("problem_statement", serde_json::json!("new objective"))
            .unwrap();
        assert_eq!(
            store.get_field("problem_statement"),
            Some(serde_json::json!("new objective"))
        );

        // Unknown keys round-trip through the pass-through map
        store.set_field("dashboard_port", serde_json::json!(8080)).unwrap();
        assert_eq!(store.get_field("dashboard_port"), Some(serde_json::json!(8080)));
        assert_eq!(store.get_field("nonexistent"), None);
    }

    #[test]
    fn test_auto_save_off_buffers_writes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("mission.json");
        let mut store = StateStore::with_auto_save(&path, false);

        store.increment_iteration().unwrap();
        assert!(!path.exists());

        store.save().unwrap();
        assert!(path.exists());

        let mut fresh = StateStore::new(&path);
        assert_eq!(fresh.mission().iteration, 1);
    }

    #[test]
    fn test_workspace_dirs() {
        let temp = tempdir().unwrap();
        let mut store = store_in(&temp);
        store
            .set_field("mission_workspace", serde_json::json!("/tmp/ws"))
            .unwrap();

        assert_eq!(store.workspace_dir(), PathBuf::from("/tmp/ws"));
        assert_eq!(store.artifacts_dir(), PathBuf::from("/tmp/ws/artifacts"));
        assert_eq!(store.research_dir(), PathBuf::from("/tmp/ws/research"));
        assert_eq!(store.tests_dir(), PathBuf::from("/tmp/ws/tests"));
    }
}
