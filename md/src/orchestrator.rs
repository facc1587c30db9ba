//! Stage orchestrator - wires state, stages, prompts, cycles, and the bus
//!
//! The orchestrator drives the PLANNING -> BUILDING -> TESTING ->
//! ANALYZING -> CYCLE_END -> COMPLETE workflow one reply at a time. It
//! never interprets reply content beyond the declared status and
//! recommendation fields; that is the stage handlers' job.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cycles::CycleManager;
use crate::events::{Event, EventKind, IntegrationBus};
use crate::integrations::RecoveryIntegration;
use crate::prompts::PromptFactory;
use crate::stages::{Stage, StageContext, StageRegistry, StageRestrictions};
use crate::state::{SharedState, lock};

/// Central coordinator for a mission's stage workflow
pub struct Orchestrator {
    state: SharedState,
    registry: StageRegistry,
    bus: Arc<IntegrationBus>,
    cycles: CycleManager,
    prompts: PromptFactory,
    recovery: Option<Arc<RecoveryIntegration>>,
    llm_provider: String,
    /// MISSION_COMPLETED must be emitted exactly once per mission
    mission_completed_emitted: bool,
}

impl Orchestrator {
    pub fn new(
        state: SharedState,
        registry: StageRegistry,
        bus: Arc<IntegrationBus>,
        prompts: PromptFactory,
    ) -> Self {
        let cycles = CycleManager::new(state.clone());
        Self {
            state,
            registry,
            bus,
            cycles,
            prompts,
            recovery: None,
            llm_provider: "default".to_string(),
            mission_completed_emitted: false,
        }
    }

    /// Attach the recovery integration for crash-context injection
    pub fn with_recovery(mut self, recovery: Arc<RecoveryIntegration>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Name the LLM provider used for ground-rules selection
    pub fn with_llm_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_provider = provider.into();
        self
    }

    pub fn current_stage(&self) -> Stage {
        lock(&self.state).mission().current_stage
    }

    pub fn mission_id(&self) -> String {
        lock(&self.state).mission().mission_id.clone()
    }

    pub fn bus(&self) -> &Arc<IntegrationBus> {
        &self.bus
    }

    pub fn cycles(&self) -> &CycleManager {
        &self.cycles
    }

    /// Emit MISSION_STARTED on a fresh mission
    pub fn begin_mission(&mut self) -> eyre::Result<()> {
        let (fresh, mission_id, stage) = {
            let mut state = lock(&self.state);
            let m = state.mission();
            (m.history.is_empty(), m.mission_id.clone(), m.current_stage)
        };

        if fresh {
            info!(%mission_id, "Mission starting");
            self.bus.emit(
                &Event::new(EventKind::MissionStarted, stage.as_str(), &mission_id).with_source("orchestrator"),
            );
            lock(&self.state).log_history("Mission started", None)?;
        }
        Ok(())
    }

    fn stage_context(&self) -> StageContext {
        let mut state = lock(&self.state);
        let workspace_dir = state.workspace_dir();
        let artifacts_dir = state.artifacts_dir();
        let research_dir = state.research_dir();
        let tests_dir = state.tests_dir();
        let m = state.mission();

        StageContext {
            mission_id: m.mission_id.clone(),
            original_mission: m.original_mission().to_string(),
            problem_statement: m.problem_statement.clone(),
            current_stage: m.current_stage,
            workspace_dir,
            artifacts_dir,
            research_dir,
            tests_dir,
            cycle_number: m.current_cycle,
            cycle_budget: m.cycle_budget,
            iteration: m.iteration,
            max_iterations: m.max_iterations,
            history: m.history.clone(),
            cycle_history: m.cycle_history.clone(),
            preferences: m.preferences.clone(),
            success_criteria: m.success_criteria.clone(),
        }
    }

    /// Build the complete prompt for the current stage
    ///
    /// Assembles ground rules, mission header, history, and the stage
    /// body, then injects knowledge-base context (PLANNING only), code
    /// memory (BUILDING only), crash-recovery context when available,
    /// and any extra context from the caller.
    pub fn build_prompt(&self, extra_context: Option<&str>) -> String {
        let ctx = self.stage_context();
        let handler = self.registry.get_handler(ctx.current_stage);
        let stage_prompt = handler.get_prompt(&ctx);

        let mut prompt = self.prompts.assemble(&stage_prompt, &ctx, &self.llm_provider);

        if ctx.current_stage == Stage::Planning {
            prompt = self.prompts.inject_kb_context(prompt, &ctx.problem_statement);
        }
        if ctx.current_stage == Stage::Building {
            prompt = self.prompts.inject_code_memory(prompt, &ctx.problem_statement);
        }

        if let Some(recovery) = &self.recovery
            && let Some(info) = recovery.recovery_info()
        {
            info!(stage = %info.stage, "Injecting crash recovery context");
            prompt = self.prompts.inject_recovery_context(prompt, &info);
        }

        if let Some(extra) = extra_context
            && !extra.is_empty()
        {
            prompt = format!("{prompt}\n\n{extra}");
        }

        self.bus.emit(
            &Event::new(EventKind::PromptGenerated, ctx.current_stage.as_str(), &ctx.mission_id)
                .with_entry("prompt_chars", json!(prompt.len()))
                .with_source("orchestrator"),
        );

        prompt
    }

    /// Process the agent's reply for the current stage
    ///
    /// A null reply is valid and treated as an empty object. Handler
    /// failure emits STAGE_FAILED and keeps the stage unchanged so the
    /// caller may retry. On success the handler's events are emitted in
    /// order, the iteration counter is bumped when the result carries
    /// the `_increment_iteration` sentinel, and the next stage is
    /// returned. The caller decides whether to transition.
    pub fn process_response(&mut self, reply: Value) -> eyre::Result<Stage> {
        let reply = if reply.is_null() { json!({}) } else { reply };

        let ctx = self.stage_context();
        let stage = ctx.current_stage;
        let handler = self.registry.get_handler(stage);

        self.bus.emit(
            &Event::new(EventKind::ResponseReceived, stage.as_str(), &ctx.mission_id).with_source("orchestrator"),
        );

        let result = match handler.process_response(&reply, &ctx) {
            Ok(result) => result,
            Err(e) => {
                warn!(%stage, error = %e, "Stage handler failed, staying in stage");
                self.bus.emit(
                    &Event::new(EventKind::StageFailed, stage.as_str(), &ctx.mission_id)
                        .with_entry("error", json!(e.to_string()))
                        .with_source("orchestrator"),
                );
                return Ok(stage);
            }
        };

        for event in &result.events_to_emit {
            if event.kind == EventKind::MissionCompleted {
                self.mission_completed_emitted = true;
            }
            self.bus.emit(event);
        }

        info!(
            %stage,
            status = %result.status,
            next_stage = %result.next_stage,
            success = result.success,
            "Stage response processed"
        );
        if let Some(message) = &result.message {
            debug!(%message, "Handler message");
        }

        if result.wants_iteration_increment() {
            let new = lock(&self.state).increment_iteration()?;
            debug!(iteration = new, "Iteration incremented by handler request");
        }

        Ok(result.next_stage)
    }

    /// Transition to a new stage
    ///
    /// Emits STAGE_COMPLETED for the old stage (unless it was COMPLETE),
    /// persists the transition, then emits STAGE_STARTED for the new
    /// stage - or MISSION_COMPLETED when entering COMPLETE, deduplicated
    /// against a handler having already emitted it.
    pub fn update_stage(&mut self, new_stage: Stage) -> eyre::Result<()> {
        let old_stage = self.current_stage();

        if old_stage == Stage::Complete && new_stage != Stage::Complete {
            warn!(%new_stage, "Mission is COMPLETE; only an explicit reset may leave it");
            return Ok(());
        }

        let ctx = self.stage_context();
        let handler = self.registry.get_handler(new_stage);
        if !handler.validate_transition(Some(old_stage), &ctx) {
            warn!(%old_stage, %new_stage, "Transition not in the stage's valid-from set");
        }

        let mission_id = ctx.mission_id.clone();
        let iteration = ctx.iteration;

        if old_stage != Stage::Complete {
            self.bus.emit(
                &Event::new(EventKind::StageCompleted, old_stage.as_str(), &mission_id)
                    .with_entry("old_stage", json!(old_stage.as_str()))
                    .with_entry("new_stage", json!(new_stage.as_str()))
                    .with_entry("iteration", json!(iteration))
                    .with_source("orchestrator"),
            );
        }

        let old = lock(&self.state).update_stage(new_stage)?;
        info!(%old, %new_stage, "Stage transition");

        if new_stage != Stage::Complete {
            self.bus.emit(
                &Event::new(EventKind::StageStarted, new_stage.as_str(), &mission_id)
                    .with_entry("old_stage", json!(old_stage.as_str()))
                    .with_entry("iteration", json!(iteration))
                    .with_source("orchestrator"),
            );
        } else if !self.mission_completed_emitted {
            self.mission_completed_emitted = true;
            self.bus.emit(
                &Event::new(EventKind::MissionCompleted, new_stage.as_str(), &mission_id)
                    .with_entry("final_stage", json!(old_stage.as_str()))
                    .with_entry("total_iterations", json!(iteration))
                    .with_entry("cycle_count", json!(self.cycles.current_cycle()))
                    .with_source("orchestrator"),
            );
        }

        Ok(())
    }

    /// Transition by stage name; unknown names are logged and ignored
    pub fn update_stage_named(&mut self, stage_name: &str) -> eyre::Result<()> {
        match stage_name.parse::<Stage>() {
            Ok(stage) => self.update_stage(stage),
            Err(e) => {
                warn!(%stage_name, error = %e, "Ignoring transition to unknown stage");
                Ok(())
            }
        }
    }

    /// Advance the mission to its next cycle
    ///
    /// No-op when the budget is spent. An empty continuation prompt is
    /// replaced by a synthesized default naming the next cycle and the
    /// original mission. Emits CYCLE_COMPLETED, advances the cycle
    /// (resetting the iteration counter), transitions to PLANNING, and
    /// emits CYCLE_STARTED.
    pub fn advance_to_next_cycle(&mut self, continuation_prompt: &str) -> eyre::Result<Option<u32>> {
        if !self.cycles.should_continue() {
            debug!("No cycles remaining, not advancing");
            return Ok(None);
        }

        let continuation = if continuation_prompt.trim().is_empty() {
            warn!("Empty continuation prompt, synthesizing default from original mission");
            self.cycles.generate_continuation_prompt(
                "No continuation prompt was provided; continue the original mission.",
                &[],
                &[],
            )
        } else {
            continuation_prompt.to_string()
        };

        let summary: String = continuation.chars().take(200).collect();
        self.bus
            .emit(&self.cycles.cycle_completed_event(&summary, Stage::Planning));

        let new_cycle = self.cycles.advance_cycle(&continuation)?;
        self.update_stage(Stage::Planning)?;

        self.bus.emit(&self.cycles.cycle_started_event());

        Ok(Some(new_cycle))
    }

    // === Stage restriction queries ===

    /// Restrictions for a stage (default: the current one)
    pub fn get_stage_restrictions(&self, stage: Option<Stage>) -> StageRestrictions {
        let stage = stage.unwrap_or_else(|| self.current_stage());
        self.registry.get_restrictions(stage)
    }

    /// Whether a tool is allowed in a stage; blocked list wins
    pub fn is_tool_allowed(&self, tool: &str, stage: Option<Stage>) -> bool {
        self.get_stage_restrictions(stage).is_tool_allowed(tool)
    }

    /// Whether a write path is allowed in a stage; forbidden globs win
    pub fn is_write_allowed(&self, path: &str, stage: Option<Stage>) -> bool {
        self.get_stage_restrictions(stage).is_write_allowed(path)
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> Value {
        let mut state = lock(&self.state);
        let m = state.mission();
        json!({
            "mission_id": m.mission_id,
            "current_stage": m.current_stage.as_str(),
            "iteration": m.iteration,
            "cycle": m.current_cycle,
            "cycle_budget": m.cycle_budget,
            "cycles_remaining": m.cycle_budget.saturating_sub(m.current_cycle),
            "integrations": serde_json::to_value(self.bus.get_stats()).unwrap_or(Value::Null),
        })
    }

    /// Workspace directory of the mission under orchestration
    pub fn workspace_dir(&self) -> PathBuf {
        lock(&self.state).workspace_dir()
    }
}
