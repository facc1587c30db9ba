//! Cycle-end stage - cycle reports, continuation, and mission completion

use serde_json::Value;
use tracing::warn;

use crate::events::{Event, EventKind};

use super::{
    Stage, StageContext, StageError, StageHandler, StageRestrictions, StageResult, message_or, reply_object,
    reply_status,
};

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Handler for the CYCLE_END stage
///
/// Two sub-modes on remaining budget: with cycles left it asks for a
/// cycle report plus a continuation prompt and routes back to PLANNING;
/// on the final cycle it asks for the final report and routes to
/// COMPLETE, emitting both CYCLE_COMPLETED and MISSION_COMPLETED.
pub struct CycleEndStageHandler;

impl StageHandler for CycleEndStageHandler {
    fn stage(&self) -> Stage {
        Stage::CycleEnd
    }

    fn valid_from(&self) -> &'static [Stage] {
        &[Stage::Analyzing]
    }

    fn get_prompt(&self, ctx: &StageContext) -> String {
        let current_cycle = ctx.cycle_number;
        let cycle_budget = ctx.cycle_budget;
        let cycles_remaining = ctx.cycles_remaining();
        let original_mission = truncate(&ctx.original_mission, 500);

        if cycles_remaining > 0 {
            format!(
                r#"=== CYCLE END STAGE ===
You have completed cycle {current_cycle} of {cycle_budget}.
Cycles remaining: {cycles_remaining}

ORIGINAL MISSION: {original_mission}

Your task:
1. Generate a comprehensive report of what was accomplished this cycle
2. List ALL files created or modified this cycle
3. Summarize key achievements and any issues encountered
4. Write a CONTINUATION PROMPT for the next cycle

The continuation prompt should:
- Build on what was accomplished
- Address any remaining work
- Be a complete, standalone mission statement for the next cycle
- Reference specific files/code if needed

Respond with JSON:
{{
    "status": "cycle_complete",
    "cycle_number": {current_cycle},
    "cycle_report": {{
        "summary": "What was accomplished this cycle",
        "files_created": ["list of new files"],
        "files_modified": ["list of modified files"],
        "achievements": ["key accomplishments"],
        "issues": ["any issues encountered"]
    }},
    "continuation_prompt": "The complete mission statement for the next cycle.",
    "message_to_human": "Cycle {current_cycle}/{cycle_budget} complete. Continuing to next cycle..."
}}
"#
            )
        } else {
            format!(
                r#"=== CYCLE END STAGE (FINAL) ===
You have completed the FINAL cycle ({current_cycle} of {cycle_budget}).

ORIGINAL MISSION: {original_mission}

Your task:
1. Generate a comprehensive FINAL report of everything accomplished across ALL cycles
2. List ALL files created or modified across the entire mission
3. Summarize the complete journey from start to finish
4. Provide lessons learned and recommendations
5. IMPORTANT: Suggest ONE follow-up mission that would naturally extend this work

Respond with JSON:
{{
    "status": "mission_complete",
    "total_cycles": {cycle_budget},
    "final_report": {{
        "summary": "Complete summary of what was accomplished across all cycles",
        "all_files": ["list of all files created/modified"],
        "key_achievements": ["major accomplishments"],
        "challenges_overcome": ["problems solved"],
        "lessons_learned": ["insights for future missions"]
    }},
    "deliverables": ["final list of deliverables"],
    "next_mission_recommendation": {{
        "mission_title": "A concise title for the recommended next mission",
        "mission_description": "What the next mission should accomplish",
        "suggested_cycles": 3,
        "rationale": "Why this mission would be valuable to pursue next"
    }},
    "message_to_human": "Mission complete after {cycle_budget} cycles."
}}
"#
            )
        }
    }

    fn process_response(&self, reply: &Value, ctx: &StageContext) -> Result<StageResult, StageError> {
        let reply = reply_object(reply, self.stage())?;
        let status = reply_status(reply);
        let current_cycle = ctx.cycle_number;
        let cycles_remaining = ctx.cycles_remaining();

        if status == "cycle_complete" && cycles_remaining > 0 {
            let continuation_prompt = reply
                .get("continuation_prompt")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            // The orchestrator emits CYCLE_COMPLETED when it advances
            // the cycle; here only the stage's own completion is noted
            let event = Event::new(EventKind::StageCompleted, self.stage().as_str(), &ctx.mission_id)
                .with_entry("cycle_number", Value::from(current_cycle))
                .with_entry("cycles_remaining", Value::from(cycles_remaining))
                .with_entry("continuation_prompt", Value::String(continuation_prompt.to_string()))
                .with_entry(
                    "cycle_report",
                    reply.get("cycle_report").cloned().unwrap_or(Value::Object(Default::default())),
                );

            let default_message = format!("Cycle {current_cycle} complete, continuing");
            Ok(StageResult::new(true, Stage::Planning, status.clone())
                .with_output(reply.clone())
                .with_events(vec![event])
                .with_message(message_or(reply, &default_message)))
        } else if status == "mission_complete" || cycles_remaining == 0 {
            let final_report = reply.get("final_report").cloned().unwrap_or(Value::Object(Default::default()));
            let cycle_event = Event::new(EventKind::CycleCompleted, self.stage().as_str(), &ctx.mission_id)
                .with_entry("cycle_number", Value::from(current_cycle))
                .with_entry("final", Value::Bool(true))
                .with_entry("final_report", final_report.clone());
            let mission_event = Event::new(EventKind::MissionCompleted, self.stage().as_str(), &ctx.mission_id)
                .with_entry("total_cycles", Value::from(ctx.cycle_budget))
                .with_entry(
                    "deliverables",
                    reply.get("deliverables").cloned().unwrap_or(Value::Array(vec![])),
                )
                .with_entry(
                    "next_mission_recommendation",
                    reply
                        .get("next_mission_recommendation")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                )
                .with_entry("final_report", final_report);

            Ok(StageResult::new(true, Stage::Complete, status)
                .with_output(reply.clone())
                .with_events(vec![cycle_event, mission_event])
                .with_message(message_or(reply, "Mission complete")))
        } else {
            warn!(%status, "CYCLE_END: unexpected status");
            Ok(StageResult::new(false, Stage::CycleEnd, status.clone())
                .with_output(reply.clone())
                .with_message(format!("Unexpected status: {status}")))
        }
    }

    fn get_restrictions(&self) -> StageRestrictions {
        StageRestrictions {
            allowed_tools: vec![
                "Read".into(),
                "Glob".into(),
                "Grep".into(),
                "Write".into(),
                "Edit".into(),
            ],
            blocked_tools: vec!["Bash".into(), "NotebookEdit".into()],
            allowed_write_paths: vec![
                "*/artifacts/*".into(),
                "*/research/*".into(),
                "*report*".into(),
                "*/mission_logs/*".into(),
            ],
            forbidden_write_paths: vec!["*.py".into(), "*.js".into(), "*.ts".into()],
            allow_bash: false,
            read_only: false,
        }
    }
}
