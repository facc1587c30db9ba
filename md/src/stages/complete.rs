//! Complete stage - terminal, read-only final summary

use serde_json::Value;

use crate::events::{Event, EventKind};

use super::{
    Stage, StageContext, StageError, StageHandler, StageRestrictions, StageResult, message_or, reply_object,
};

/// Handler for the COMPLETE stage
///
/// Terminal and read-only. Self-loops: the mission stays COMPLETE until
/// an explicit reset.
pub struct CompleteStageHandler;

impl StageHandler for CompleteStageHandler {
    fn stage(&self) -> Stage {
        Stage::Complete
    }

    fn valid_from(&self) -> &'static [Stage] {
        &[Stage::CycleEnd, Stage::Analyzing]
    }

    fn get_prompt(&self, _ctx: &StageContext) -> String {
        r#"=== COMPLETE STAGE ===
The mission has been completed!

Generate a final summary:

Respond with JSON:
{
    "status": "mission_complete",
    "summary": "What was accomplished",
    "deliverables": ["list of deliverables"],
    "lessons_learned": ["any insights for future missions"],
    "message_to_human": "Mission complete message"
}
"#
        .to_string()
    }

    fn process_response(&self, reply: &Value, ctx: &StageContext) -> Result<StageResult, StageError> {
        let reply = reply_object(reply, self.stage())?;
        let status = reply
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("mission_complete")
            .to_string();

        let event = Event::new(EventKind::MissionCompleted, self.stage().as_str(), &ctx.mission_id)
            .with_entry("status", Value::String(status.clone()))
            .with_entry(
                "summary",
                reply
                    .get("summary")
                    .cloned()
                    .unwrap_or(Value::String("Mission completed".into())),
            )
            .with_entry(
                "deliverables",
                reply.get("deliverables").cloned().unwrap_or(Value::Array(vec![])),
            )
            .with_entry(
                "lessons_learned",
                reply.get("lessons_learned").cloned().unwrap_or(Value::Array(vec![])),
            )
            .with_entry("cycle_count", Value::from(ctx.cycle_number));

        Ok(StageResult::new(true, Stage::Complete, status)
            .with_output(reply.clone())
            .with_events(vec![event])
            .with_message(message_or(reply, "Mission complete")))
    }

    fn get_restrictions(&self) -> StageRestrictions {
        StageRestrictions {
            allowed_tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
            blocked_tools: vec!["Edit".into(), "Write".into(), "NotebookEdit".into(), "Bash".into()],
            allowed_write_paths: vec![],
            forbidden_write_paths: vec!["*".into()],
            allow_bash: false,
            read_only: true,
        }
    }
}
