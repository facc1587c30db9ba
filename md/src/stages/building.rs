//! Building stage - implementation of the planned solution

use serde_json::Value;
use tracing::warn;

use crate::events::{Event, EventKind};

use super::{
    Stage, StageContext, StageError, StageHandler, StageRestrictions, StageResult, message_or, reply_object,
    reply_status,
};

/// Handler for the BUILDING stage
///
/// Full write access. Code-memory snippets are injected above this body
/// by the prompt factory. Moves to TESTING once the build is complete
/// and the agent declares it ready.
pub struct BuildingStageHandler;

impl StageHandler for BuildingStageHandler {
    fn stage(&self) -> Stage {
        Stage::Building
    }

    fn valid_from(&self) -> &'static [Stage] {
        &[Stage::Planning, Stage::Analyzing, Stage::Building]
    }

    fn get_prompt(&self, ctx: &StageContext) -> String {
        let artifacts_dir = ctx.artifacts_dir.display();
        let workspace_dir = ctx.workspace_dir.display();

        format!(
            r#"=== BUILDING STAGE ===
Your goal: Implement the solution based on your plan.

Tasks:
1. Read your plan from {artifacts_dir}/implementation_plan.md
2. Write code to {workspace_dir}/
3. Create all necessary files and directories
4. Ensure code is complete and runnable
5. Follow any style preferences specified

Respond with JSON:
{{
    "status": "build_complete" | "build_in_progress" | "build_blocked",
    "files_created": ["list of files created"],
    "files_modified": ["list of files modified"],
    "summary": "What was built",
    "ready_for_testing": true | false,
    "blockers": ["any blockers, or empty list"],
    "message_to_human": "Build status message"
}}
"#
        )
    }

    fn process_response(&self, reply: &Value, ctx: &StageContext) -> Result<StageResult, StageError> {
        let reply = reply_object(reply, self.stage())?;
        let status = reply_status(reply);
        let ready_for_testing = reply
            .get("ready_for_testing")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        match status.as_str() {
            "build_complete" if ready_for_testing => {
                let event = Event::new(EventKind::StageCompleted, self.stage().as_str(), &ctx.mission_id)
                    .with_entry("status", Value::String(status.clone()))
                    .with_entry(
                        "files_created",
                        reply.get("files_created").cloned().unwrap_or(Value::Array(vec![])),
                    )
                    .with_entry(
                        "files_modified",
                        reply.get("files_modified").cloned().unwrap_or(Value::Array(vec![])),
                    );

                Ok(StageResult::new(true, Stage::Testing, status)
                    .with_output(reply.clone())
                    .with_events(vec![event])
                    .with_message(message_or(reply, "Build complete, moving to testing")))
            }
            "build_in_progress" => Ok(StageResult::new(true, Stage::Building, status)
                .with_output(reply.clone())
                .with_message(message_or(reply, "Build in progress"))),
            "build_blocked" => {
                warn!("Build blocked - may need replanning");
                Ok(StageResult::new(false, Stage::Building, status)
                    .with_output(reply.clone())
                    .with_message(message_or(reply, "Build blocked")))
            }
            _ => Ok(StageResult::new(true, Stage::Building, status)
                .with_output(reply.clone())
                .with_message(message_or(reply, "Continuing build"))),
        }
    }

    fn get_restrictions(&self) -> StageRestrictions {
        StageRestrictions::unrestricted()
    }
}
