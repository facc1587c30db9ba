//! Planning stage - mission understanding and implementation planning

use serde_json::Value;
use tracing::warn;

use crate::events::{Event, EventKind};

use super::{
    Stage, StageContext, StageError, StageHandler, StageRestrictions, StageResult, message_or, reply_object,
    reply_status,
};

/// Handler for the PLANNING stage
///
/// Combines mission understanding with plan creation. Knowledge-base
/// learnings are injected above this body by the prompt factory. Writes
/// are limited to artifacts/ and research/; no source code yet.
pub struct PlanningStageHandler;

impl StageHandler for PlanningStageHandler {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    fn valid_from(&self) -> &'static [Stage] {
        &[Stage::CycleEnd, Stage::Analyzing, Stage::Planning]
    }

    fn get_prompt(&self, ctx: &StageContext) -> String {
        let workspace_dir = ctx.workspace_dir.display();
        let artifacts_dir = ctx.artifacts_dir.display();
        let research_dir = ctx.research_dir.display();

        format!(
            r#"=== PLANNING STAGE ===
Your goal: Understand the mission AND create a detailed implementation plan.

IMPORTANT: You are AUTONOMOUS. Do NOT ask clarifying questions. Make reasonable assumptions and proceed.

In PLANNING stage, you may ONLY write to artifacts/ or research/ directories.
Do NOT write actual code yet. Save implementation for BUILDING stage.

=== RESEARCH PHASE (BEFORE Implementation Planning) ===
Your implementation plan should be EVIDENCE-BASED.

MANDATORY: Knowledge Base Consultation
The Knowledge Base context above (if present) contains results from past missions.
- These are learnings from similar problems solved before
- PAY ATTENTION to gotchas - these are past failures to prevent
- Apply relevant techniques if they match your current problem

Research Tasks:
1. FIRST: Review any Knowledge Base context above and incorporate relevant learnings
2. Search for current best practices for the task
3. Look for common pitfalls and "what NOT to do" guidance
4. Document research findings in {research_dir}/research_findings.md

=== IMPLEMENTATION PLANNING ===

Tasks (in order):
1. Read and understand the problem statement above
2. Explore the workspace to understand existing patterns
3. Identify key requirements and constraints
4. Make reasonable assumptions for any ambiguities
5. Break down the problem into concrete steps
6. Identify files to create/modify in {workspace_dir}/
7. Define clear success criteria
8. Write your plan to {artifacts_dir}/implementation_plan.md

Respond with JSON:
{{
    "status": "plan_complete",
    "understanding": "Your summary of what needs to be built",
    "kb_learnings_applied": ["list any learnings you incorporated, or empty"],
    "key_requirements": ["requirement1", "requirement2"],
    "assumptions": ["any assumptions you made"],
    "approach": "Brief description of chosen approach",
    "steps": [
        {{"step": 1, "description": "...", "files": ["file1"]}}
    ],
    "success_criteria": ["criterion1", "criterion2"],
    "message_to_human": "Planning complete. Ready to build."
}}
"#
        )
    }

    fn process_response(&self, reply: &Value, ctx: &StageContext) -> Result<StageResult, StageError> {
        let reply = reply_object(reply, self.stage())?;
        let status = reply_status(reply);

        if status == "plan_complete" {
            let steps_planned = reply.get("steps").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
            let event = Event::new(EventKind::StageCompleted, self.stage().as_str(), &ctx.mission_id)
                .with_entry("status", Value::String(status.clone()))
                .with_entry(
                    "kb_learnings",
                    reply.get("kb_learnings_applied").cloned().unwrap_or(Value::Array(vec![])),
                )
                .with_entry("steps_planned", Value::from(steps_planned));

            Ok(StageResult::new(true, Stage::Building, status)
                .with_output(reply.clone())
                .with_events(vec![event])
                .with_message(message_or(reply, "Plan complete, moving to building")))
        } else {
            warn!(%status, "PLANNING: unexpected status, staying in PLANNING");
            Ok(StageResult::new(false, Stage::Planning, status.clone())
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
                "Bash".into(),
                "WebFetch".into(),
                "WebSearch".into(),
                "Task".into(),
            ],
            blocked_tools: vec!["NotebookEdit".into()],
            allowed_write_paths: vec![
                "*/artifacts/*".into(),
                "*/research/*".into(),
                "*implementation_plan.md".into(),
            ],
            forbidden_write_paths: vec!["*.py".into(), "*.js".into(), "*.ts".into()],
            allow_bash: true,
            read_only: false,
        }
    }
}
