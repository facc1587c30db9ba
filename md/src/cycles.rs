//! Cycle manager - multi-cycle iteration over the mission budget
//!
//! The state store owns the cycle history; this manager is its only
//! writer. It tracks the budget, advances cycles, and builds the
//! continuation prompt and cycle lifecycle events.

use serde_json::{Map, Value};
use tracing::info;

use crate::events::{Event, EventKind};
use crate::stages::Stage;
use crate::state::{SharedState, StateError, lock};

/// Manages multi-cycle mission iteration
pub struct CycleManager {
    state: SharedState,
}

impl CycleManager {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub fn current_cycle(&self) -> u32 {
        lock(&self.state).mission().current_cycle
    }

    pub fn cycle_budget(&self) -> u32 {
        lock(&self.state).mission().cycle_budget
    }

    pub fn cycles_remaining(&self) -> u32 {
        let mut state = lock(&self.state);
        let m = state.mission();
        m.cycle_budget.saturating_sub(m.current_cycle)
    }

    pub fn is_last_cycle(&self) -> bool {
        self.cycles_remaining() == 0
    }

    /// Whether another cycle can be started
    pub fn should_continue(&self) -> bool {
        self.cycles_remaining() > 0
    }

    /// Advance the mission to the next cycle
    ///
    /// Records the completed cycle, resets the iteration counter, and
    /// installs the continuation prompt as the new problem statement.
    pub fn advance_cycle(&self, continuation_prompt: &str) -> Result<u32, StateError> {
        let mut state = lock(&self.state);
        if state.mission().original_problem_statement.is_none() {
            let original = state.mission().problem_statement.clone();
            state.set_field("original_problem_statement", Value::String(original))?;
        }
        let old = state.mission().current_cycle;
        let new = state.advance_cycle(continuation_prompt)?;
        info!(old_cycle = old, new_cycle = new, "Advanced cycle");
        Ok(new)
    }

    /// Record the completed cycle's outcome in its history entry
    pub fn record_completion(&self, summary: &str, status: &str) -> Result<(), StateError> {
        lock(&self.state).annotate_last_cycle(status, summary)
    }

    /// Build the continuation prompt for the next cycle
    pub fn generate_continuation_prompt(&self, cycle_summary: &str, findings: &[String], objectives: &[String]) -> String {
        let mut state = lock(&self.state);
        let m = state.mission();
        let original = m.original_mission().to_string();
        let next_cycle = m.current_cycle + 1;
        let budget = m.cycle_budget;
        let current = m.current_cycle;
        drop(state);

        let findings_text = if findings.is_empty() {
            "None documented".to_string()
        } else {
            findings.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n")
        };
        let objectives_text = if objectives.is_empty() {
            "Continue from previous cycle".to_string()
        } else {
            objectives.iter().map(|o| format!("- {o}")).collect::<Vec<_>>().join("\n")
        };

        format!(
            r#"=== CONTINUATION: Cycle {next_cycle} of {budget} ===

ORIGINAL MISSION:
{original}

PREVIOUS CYCLE SUMMARY:
{cycle_summary}

KEY FINDINGS FROM CYCLE {current}:
{findings_text}

OBJECTIVES FOR THIS CYCLE:
{objectives_text}

Continue the mission, building on the work from the previous cycle.
Focus on the objectives above and address any outstanding issues.
"#
        )
    }

    /// Current cycle context as an event payload
    pub fn cycle_context(&self) -> Map<String, Value> {
        let mut state = lock(&self.state);
        let m = state.mission();
        let mut data = Map::new();
        data.insert("current_cycle".to_string(), Value::from(m.current_cycle));
        data.insert("cycle_budget".to_string(), Value::from(m.cycle_budget));
        data.insert(
            "cycles_remaining".to_string(),
            Value::from(m.cycle_budget.saturating_sub(m.current_cycle)),
        );
        data.insert(
            "is_last_cycle".to_string(),
            Value::Bool(m.current_cycle >= m.cycle_budget),
        );
        data.insert("iteration".to_string(), Value::from(m.iteration));
        data
    }

    /// Build a CYCLE_STARTED event for the new cycle
    pub fn cycle_started_event(&self) -> Event {
        let mission_id = lock(&self.state).mission().mission_id.clone();
        Event::new(EventKind::CycleStarted, Stage::Planning.as_str(), mission_id)
            .with_data(self.cycle_context())
            .with_source("cycle_manager")
    }

    /// Build a CYCLE_COMPLETED event for the finished cycle
    pub fn cycle_completed_event(&self, summary: &str, next_stage: Stage) -> Event {
        let mission_id = lock(&self.state).mission().mission_id.clone();
        let mut data = self.cycle_context();
        data.insert("summary".to_string(), Value::String(summary.to_string()));
        data.insert("next_stage".to_string(), Value::String(next_stage.to_string()));
        Event::new(EventKind::CycleCompleted, next_stage.as_str(), mission_id)
            .with_data(data)
            .with_source("cycle_manager")
    }

    /// Format recent cycle history for prompt inclusion
    pub fn format_history_for_prompt(&self, max_cycles: usize) -> String {
        let mut state = lock(&self.state);
        let history = &state.mission().cycle_history;
        if history.is_empty() {
            return "No previous cycles completed.".to_string();
        }

        let start = history.len().saturating_sub(max_cycles);
        history[start..]
            .iter()
            .map(|cycle| {
                format!(
                    "Cycle {} ({}, {} iterations):\n  {}",
                    cycle.cycle, cycle.status, cycle.iteration_count, cycle.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Human-readable cycle progress report
    pub fn cycle_report(&self) -> String {
        let mut state = lock(&self.state);
        let m = state.mission();
        let mut lines = vec![
            "=== Cycle Progress Report ===".to_string(),
            format!("Current Cycle: {} of {}", m.current_cycle, m.cycle_budget),
            format!("Iterations in Cycle: {}", m.iteration),
            format!(
                "Cycles Remaining: {}",
                m.cycle_budget.saturating_sub(m.current_cycle)
            ),
            String::new(),
        ];

        if m.cycle_history.is_empty() {
            lines.push("No previous cycles.".to_string());
        } else {
            lines.push("Previous Cycles:".to_string());
            for cycle in &m.cycle_history {
                let summary: String = cycle.summary.chars().take(100).collect();
                lines.push(format!("  Cycle {} [{}]: {}", cycle.cycle, cycle.status, summary));
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateStore, shared};
    use serde_json::json;
    use tempfile::tempdir;

    fn manager_with_budget(budget: u32) -> (tempfile::TempDir, CycleManager) {
        let temp = tempdir().unwrap();
        let mut store = StateStore::new(temp.path().join("mission.json"));
        store.set_field("cycle_budget", json!(budget)).unwrap();
        store
            .set_field("problem_statement", json!("Design a cache"))
            .unwrap();
        let manager = CycleManager::new(shared(store));
        (temp, manager)
    }

    #[test]
    fn test_should_continue_respects_budget() {
        let (_t, manager) = manager_with_budget(2);
        assert!(manager.should_continue());
        assert_eq!(manager.cycles_remaining(), 1);

        manager.advance_cycle("next").unwrap();
        assert!(!manager.should_continue());
        assert!(manager.is_last_cycle());
    }

    #[test]
    fn test_advance_preserves_original_statement() {
        let (_t, manager) = manager_with_budget(3);
        manager.advance_cycle("cycle two objective").unwrap();

        let mut state = lock(&manager.state);
        let m = state.mission();
        assert_eq!(m.original_problem_statement.as_deref(), Some("Design a cache"));
        assert_eq!(m.problem_statement, "cycle two objective");
        assert_eq!(m.current_cycle, 2);
        assert_eq!(m.iteration, 0);
    }

    #[test]
    fn test_continuation_prompt_contents() {
        let (_t, manager) = manager_with_budget(2);
        let prompt = manager.generate_continuation_prompt(
            "Built the core",
            &["caching is hard".to_string()],
            &["add eviction".to_string()],
        );

        assert!(prompt.contains("Cycle 2 of 2"));
        assert!(prompt.contains("Design a cache"));
        assert!(prompt.contains("- caching is hard"));
        assert!(prompt.contains("- add eviction"));
    }

    #[test]
    fn test_continuation_prompt_defaults() {
        let (_t, manager) = manager_with_budget(2);
        let prompt = manager.generate_continuation_prompt("summary", &[], &[]);
        assert!(prompt.contains("None documented"));
        assert!(prompt.contains("Continue from previous cycle"));
    }

    #[test]
    fn test_cycle_events() {
        let (_t, manager) = manager_with_budget(2);
        let started = manager.cycle_started_event();
        assert_eq!(started.kind, EventKind::CycleStarted);
        assert_eq!(started.stage, "PLANNING");
        assert_eq!(started.source.as_deref(), Some("cycle_manager"));

        let completed = manager.cycle_completed_event("did things", Stage::Planning);
        assert_eq!(completed.kind, EventKind::CycleCompleted);
        assert_eq!(completed.data.get("summary"), Some(&json!("did things")));
    }

    #[test]
    fn test_record_completion_annotates_history() {
        let (_t, manager) = manager_with_budget(2);
        manager.advance_cycle("next").unwrap();
        manager.record_completion("all goals met", "completed").unwrap();

        let text = manager.format_history_for_prompt(5);
        assert!(text.contains("Cycle 1 (completed, 0 iterations)"));
        assert!(text.contains("all goals met"));
    }

    #[test]
    fn test_format_history_empty() {
        let (_t, manager) = manager_with_budget(1);
        assert_eq!(manager.format_history_for_prompt(5), "No previous cycles completed.");
    }
}
