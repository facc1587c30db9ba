//! Stage handlers - pluggable logic for each workflow stage
//!
//! Each stage handler produces the stage-specific prompt body and
//! interprets the agent's reply into a [`StageResult`] telling the
//! orchestrator where to go next and which events to emit.

mod analyzing;
mod building;
mod complete;
mod cycle_end;
mod planning;
mod registry;
mod testing;

pub use analyzing::AnalyzingStageHandler;
pub use building::BuildingStageHandler;
pub use complete::CompleteStageHandler;
pub use cycle_end::CycleEndStageHandler;
pub use planning::PlanningStageHandler;
pub use registry::StageRegistry;
pub use testing::TestingStageHandler;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::Event;
use crate::state::{CycleSummary, HistoryEntry};

/// Sentinel key in [`StageResult::output_data`] instructing the
/// orchestrator to bump the iteration counter.
pub const INCREMENT_ITERATION_KEY: &str = "_increment_iteration";

/// The six workflow stages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Planning,
    Building,
    Testing,
    Analyzing,
    CycleEnd,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Planning,
        Stage::Building,
        Stage::Testing,
        Stage::Analyzing,
        Stage::CycleEnd,
        Stage::Complete,
    ];

    /// Canonical stage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "PLANNING",
            Stage::Building => "BUILDING",
            Stage::Testing => "TESTING",
            Stage::Analyzing => "ANALYZING",
            Stage::CycleEnd => "CYCLE_END",
            Stage::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Planning
    }
}

/// Error for stage names outside the closed set
#[derive(Debug, Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLANNING" => Ok(Stage::Planning),
            "BUILDING" => Ok(Stage::Building),
            "TESTING" => Ok(Stage::Testing),
            "ANALYZING" => Ok(Stage::Analyzing),
            "CYCLE_END" => Ok(Stage::CycleEnd),
            "COMPLETE" => Ok(Stage::Complete),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

/// Snapshot of mission state passed to stage handlers
#[derive(Clone, Debug)]
pub struct StageContext {
    pub mission_id: String,
    pub original_mission: String,
    pub problem_statement: String,
    pub current_stage: Stage,

    pub workspace_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub research_dir: PathBuf,
    pub tests_dir: PathBuf,

    pub cycle_number: u32,
    pub cycle_budget: u32,
    pub iteration: u32,
    pub max_iterations: u32,

    pub history: Vec<HistoryEntry>,
    pub cycle_history: Vec<CycleSummary>,

    pub preferences: Map<String, Value>,
    pub success_criteria: Vec<String>,
}

impl StageContext {
    /// Cycles left after the current one
    pub fn cycles_remaining(&self) -> u32 {
        self.cycle_budget.saturating_sub(self.cycle_number)
    }
}

/// Per-stage policy for what the agent may touch
///
/// Path lists are glob patterns. An empty allow list means "no
/// restriction"; the blocked/forbidden lists always win.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StageRestrictions {
    pub allowed_tools: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub allowed_write_paths: Vec<String>,
    pub forbidden_write_paths: Vec<String>,
    pub allow_bash: bool,
    pub read_only: bool,
}

impl StageRestrictions {
    /// Unrestricted profile (BUILDING, TESTING)
    pub fn unrestricted() -> Self {
        Self {
            allowed_tools: Vec::new(),
            blocked_tools: Vec::new(),
            allowed_write_paths: vec!["*".to_string()],
            forbidden_write_paths: Vec::new(),
            allow_bash: true,
            read_only: false,
        }
    }

    /// Blocked list first, then allow-list membership when non-empty
    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        if self.blocked_tools.iter().any(|t| t == tool) {
            return false;
        }
        if !self.allowed_tools.is_empty() {
            return self.allowed_tools.iter().any(|t| t == tool);
        }
        true
    }

    /// Forbidden globs first, then allowed globs when non-empty
    pub fn is_write_allowed(&self, path: &str) -> bool {
        if self.read_only {
            return false;
        }
        let matches = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .any(|p| p.matches(path))
        };
        if matches(&self.forbidden_write_paths) {
            return false;
        }
        if !self.allowed_write_paths.is_empty() {
            return matches(&self.allowed_write_paths);
        }
        true
    }
}

/// Outcome of processing the agent's reply for one stage
#[derive(Clone, Debug)]
pub struct StageResult {
    pub success: bool,
    pub next_stage: Stage,
    pub status: String,
    pub output_data: Map<String, Value>,
    pub events_to_emit: Vec<Event>,
    pub message: Option<String>,
}

impl StageResult {
    pub fn new(success: bool, next_stage: Stage, status: impl Into<String>) -> Self {
        Self {
            success,
            next_stage,
            status: status.into(),
            output_data: Map::new(),
            events_to_emit: Vec::new(),
            message: None,
        }
    }

    pub fn with_output(mut self, output_data: Map<String, Value>) -> Self {
        self.output_data = output_data;
        self
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events_to_emit = events;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Mark the result as requiring an iteration bump
    pub fn increment_iteration(mut self) -> Self {
        self.output_data
            .insert(INCREMENT_ITERATION_KEY.to_string(), Value::Bool(true));
        self
    }

    /// Whether the orchestrator should bump the iteration counter
    pub fn wants_iteration_increment(&self) -> bool {
        self.output_data
            .get(INCREMENT_ITERATION_KEY)
            .map(value_is_truthy)
            .unwrap_or(false)
    }
}

fn value_is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Errors from stage handler processing
#[derive(Debug, Error)]
pub enum StageError {
    #[error("malformed reply for {stage}: {detail}")]
    MalformedReply { stage: Stage, detail: String },
}

/// Interface implemented by every stage handler
pub trait StageHandler: Send + Sync {
    /// The stage this handler drives
    fn stage(&self) -> Stage;

    /// Stages from which entry into this one is legal (empty = any)
    fn valid_from(&self) -> &'static [Stage] {
        &[]
    }

    /// Produce the stage-specific prompt body
    fn get_prompt(&self, ctx: &StageContext) -> String;

    /// Interpret the agent's reply
    fn process_response(&self, reply: &Value, ctx: &StageContext) -> Result<StageResult, StageError>;

    /// Check that entry into this stage is legal
    ///
    /// `from` is None at mission start, which only PLANNING accepts.
    fn validate_transition(&self, from: Option<Stage>, _ctx: &StageContext) -> bool {
        match from {
            None => self.stage() == Stage::Planning,
            Some(f) => {
                let valid = self.valid_from();
                valid.is_empty() || valid.contains(&f) || f == self.stage()
            }
        }
    }

    /// The restriction profile enforced while this stage runs
    fn get_restrictions(&self) -> StageRestrictions;
}

// === Reply helpers shared by the handlers ===

/// Require the reply to be a JSON object
pub(crate) fn reply_object<'a>(reply: &'a Value, stage: Stage) -> Result<&'a Map<String, Value>, StageError> {
    reply.as_object().ok_or_else(|| StageError::MalformedReply {
        stage,
        detail: format!("expected a JSON object, got {}", value_kind(reply)),
    })
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The reply's `status` field, empty when missing
pub(crate) fn reply_status(reply: &Map<String, Value>) -> String {
    reply
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// The reply's `message_to_human`, or a default
pub(crate) fn message_or<'a>(reply: &'a Map<String, Value>, default: &'a str) -> &'a str {
    reply.get("message_to_human").and_then(|v| v.as_str()).unwrap_or(default)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn test_stage_parse_case_insensitive() {
        assert_eq!("planning".parse::<Stage>().unwrap(), Stage::Planning);
        assert_eq!("cycle_end".parse::<Stage>().unwrap(), Stage::CycleEnd);
        assert!("SHIPPING".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_serde_names() {
        assert_eq!(serde_json::to_string(&Stage::CycleEnd).unwrap(), "\"CYCLE_END\"");
        let parsed: Stage = serde_json::from_str("\"ANALYZING\"").unwrap();
        assert_eq!(parsed, Stage::Analyzing);
    }

    #[test]
    fn test_tool_allowed_blocked_first() {
        let r = StageRestrictions {
            allowed_tools: vec!["Read".into(), "Write".into()],
            blocked_tools: vec!["Write".into()],
            ..Default::default()
        };
        // Blocked wins even when also in the allow list
        assert!(!r.is_tool_allowed("Write"));
        assert!(r.is_tool_allowed("Read"));
        assert!(!r.is_tool_allowed("Bash"));
    }

    #[test]
    fn test_tool_allowed_empty_allow_list() {
        let r = StageRestrictions {
            blocked_tools: vec!["NotebookEdit".into()],
            ..Default::default()
        };
        assert!(r.is_tool_allowed("AnythingElse"));
        assert!(!r.is_tool_allowed("NotebookEdit"));
    }

    #[test]
    fn test_write_allowed_globs() {
        let r = StageRestrictions {
            allowed_write_paths: vec!["*/artifacts/*".into(), "*implementation_plan.md".into()],
            forbidden_write_paths: vec!["*.py".into(), "*.js".into()],
            allow_bash: true,
            ..Default::default()
        };
        assert!(r.is_write_allowed("ws/artifacts/notes.md"));
        assert!(r.is_write_allowed("ws/artifacts/implementation_plan.md"));
        assert!(!r.is_write_allowed("ws/artifacts/script.py"));
        assert!(!r.is_write_allowed("ws/src/main.js"));
        assert!(!r.is_write_allowed("ws/src/lib.rs"));
    }

    #[test]
    fn test_write_allowed_read_only() {
        let r = StageRestrictions {
            read_only: true,
            allowed_write_paths: vec!["*".into()],
            ..Default::default()
        };
        assert!(!r.is_write_allowed("anything.md"));
    }

    #[test]
    fn test_increment_iteration_sentinel() {
        let result = StageResult::new(true, Stage::Building, "needs_revision").increment_iteration();
        assert!(result.wants_iteration_increment());
        assert_eq!(
            result.output_data.get(INCREMENT_ITERATION_KEY),
            Some(&Value::Bool(true))
        );

        let plain = StageResult::new(true, Stage::CycleEnd, "success");
        assert!(!plain.wants_iteration_increment());
    }

    #[test]
    fn test_truthiness() {
        assert!(value_is_truthy(&Value::Bool(true)));
        assert!(!value_is_truthy(&Value::Bool(false)));
        assert!(!value_is_truthy(&Value::Null));
        assert!(value_is_truthy(&serde_json::json!(1)));
        assert!(!value_is_truthy(&serde_json::json!(0)));
        assert!(value_is_truthy(&serde_json::json!("yes")));
        assert!(!value_is_truthy(&serde_json::json!("")));
    }

    #[test]
    fn test_reply_object_rejects_non_objects() {
        let err = reply_object(&Value::String("nope".into()), Stage::Planning).unwrap_err();
        assert!(err.to_string().contains("expected a JSON object"));
        assert!(reply_object(&serde_json::json!({}), Stage::Planning).is_ok());
    }
}
