//! Mission record - the single JSON document describing a mission run

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stages::Stage;

/// One entry in the append-only mission history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Summary of one completed cycle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u32,
    pub completed_at: DateTime<Utc>,
    pub iteration_count: u32,
    pub continuation_prompt: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub summary: String,
}

/// The mission record, one per run
///
/// Unknown keys survive load/save round trips via `extra`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionRecord {
    pub mission_id: String,
    pub problem_statement: String,
    /// The user's initial statement, preserved across cycles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_problem_statement: Option<String>,
    pub current_stage: Stage,
    /// Revision back-edges taken in the current cycle
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_cycle: u32,
    pub cycle_budget: u32,
    pub history: Vec<HistoryEntry>,
    pub cycle_history: Vec<CycleSummary>,
    pub preferences: Map<String, Value>,
    pub success_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MissionRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            mission_id: "default".to_string(),
            problem_statement: "No mission defined. Please set a mission.".to_string(),
            original_problem_statement: None,
            current_stage: Stage::Planning,
            iteration: 0,
            max_iterations: 10,
            current_cycle: 1,
            cycle_budget: 1,
            history: Vec::new(),
            cycle_history: Vec::new(),
            preferences: Map::new(),
            success_criteria: Vec::new(),
            created_at: now,
            last_updated: now,
            mission_workspace: None,
            mission_dir: None,
            extra: Map::new(),
        }
    }
}

impl MissionRecord {
    /// The original mission statement, falling back to the current one
    pub fn original_mission(&self) -> &str {
        self.original_problem_statement
            .as_deref()
            .unwrap_or(&self.problem_statement)
    }
}
