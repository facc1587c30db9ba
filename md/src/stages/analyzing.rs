//! Analyzing stage - evaluates test results and decides next steps

use serde_json::Value;
use tracing::warn;

use crate::events::{Event, EventKind};

use super::{
    Stage, StageContext, StageError, StageHandler, StageRestrictions, StageResult, message_or, reply_object,
    reply_status,
};

/// Handler for the ANALYZING stage
///
/// Routes on `status` and `recommendation`, first match wins:
/// success/COMPLETE go to CYCLE_END, needs_revision/BUILDING back to
/// BUILDING, needs_replanning/PLANNING back to PLANNING. The back-edges
/// are the only paths that bump the iteration counter.
pub struct AnalyzingStageHandler;

impl StageHandler for AnalyzingStageHandler {
    fn stage(&self) -> Stage {
        Stage::Analyzing
    }

    fn valid_from(&self) -> &'static [Stage] {
        &[Stage::Testing]
    }

    fn get_prompt(&self, ctx: &StageContext) -> String {
        let research_dir = ctx.research_dir.display();
        let artifacts_dir = ctx.artifacts_dir.display();

        format!(
            r#"=== ANALYZING STAGE ===
Your goal: Evaluate results and decide next steps.

IMPORTANT: In ANALYZING stage, only write to research/ or artifacts/.
Do NOT fix bugs here. If fixes are needed, recommend BUILDING stage.

Tasks:
1. Review test results from {artifacts_dir}/test_results.md
2. If tests passed: Prepare completion report
3. If tests failed: Diagnose issues and plan fixes
4. Document analysis in {research_dir}/analysis.md

Respond with JSON:
{{
    "status": "success" | "needs_revision" | "needs_replanning",
    "analysis": "Your analysis of the results",
    "issues_found": ["list of issues, or empty"],
    "proposed_fixes": ["list of fixes if needed, or empty"],
    "recommendation": "COMPLETE" | "BUILDING" | "PLANNING",
    "message_to_human": "Analysis summary"
}}

If recommending COMPLETE, also include:
{{
    ...
    "final_report": "Summary of what was accomplished",
    "deliverables": ["list of files/artifacts produced"]
}}
"#
        )
    }

    fn process_response(&self, reply: &Value, ctx: &StageContext) -> Result<StageResult, StageError> {
        let reply = reply_object(reply, self.stage())?;
        let status = reply_status(reply);
        let recommendation = reply
            .get("recommendation")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_uppercase();

        let event = Event::new(EventKind::StageCompleted, self.stage().as_str(), &ctx.mission_id)
            .with_entry("status", Value::String(status.clone()))
            .with_entry("recommendation", Value::String(recommendation.clone()))
            .with_entry(
                "issues_found",
                reply.get("issues_found").cloned().unwrap_or(Value::Array(vec![])),
            );

        // Rows evaluate top-to-bottom; first match wins
        if status == "success" || recommendation == "COMPLETE" {
            Ok(StageResult::new(true, Stage::CycleEnd, status)
                .with_output(reply.clone())
                .with_events(vec![event])
                .with_message(message_or(reply, "Analysis complete, moving to cycle end")))
        } else if status == "needs_revision" || recommendation == "BUILDING" {
            Ok(StageResult::new(true, Stage::Building, status)
                .with_output(reply.clone())
                .with_events(vec![event])
                .with_message(message_or(reply, "Needs revision, returning to building"))
                .increment_iteration())
        } else if status == "needs_replanning" || recommendation == "PLANNING" {
            Ok(StageResult::new(true, Stage::Planning, status)
                .with_output(reply.clone())
                .with_events(vec![event])
                .with_message(message_or(reply, "Needs replanning"))
                .increment_iteration())
        } else {
            warn!(%status, "ANALYZING: unexpected status, defaulting to CYCLE_END");
            Ok(StageResult::new(true, Stage::CycleEnd, status)
                .with_output(reply.clone())
                .with_events(vec![event])
                .with_message("Analysis complete"))
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
                "WebFetch".into(),
                "WebSearch".into(),
                "Task".into(),
            ],
            blocked_tools: vec![],
            allowed_write_paths: vec![
                "*/artifacts/*".into(),
                "*/research/*".into(),
                "*analysis.md".into(),
                "*report.md".into(),
                "*test_results.md".into(),
            ],
            forbidden_write_paths: vec!["*.py".into(), "*.js".into(), "*.ts".into()],
            allow_bash: false,
            read_only: false,
        }
    }
}
