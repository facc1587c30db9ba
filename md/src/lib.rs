//! missiond - Autonomous R&D Mission Engine
//!
//! missiond drives an external LLM agent through a disciplined,
//! multi-stage workflow (PLANNING -> BUILDING -> TESTING -> ANALYZING ->
//! CYCLE_END -> COMPLETE), one iteration at a time, until the mission is
//! declared complete or halted. State persists in a single JSON record,
//! so a mission survives crashes and spans many physical LLM
//! invocations via context handoffs.
//!
//! # Core Concepts
//!
//! - **Stages over vibes**: each stage has a contract - a prompt, a
//!   reply schema, a restriction profile, and explicit transitions
//! - **State in files**: the mission record is the single source of
//!   truth, persisted atomically after every mutation
//! - **Handoffs, not timeouts**: the context watcher tails the live
//!   transcript and restarts the agent before its window is exhausted
//! - **Failure-isolated integrations**: cross-cutting concerns observe
//!   lifecycle events through a priority-ordered bus
//!
//! # Modules
//!
//! - [`orchestrator`] - the stage state machine
//! - [`conductor`] - the outer retry/handoff loop
//! - [`watcher`] - transcript tailing and handoff signals
//! - [`events`] - the integration event bus
//! - [`state`] - mission record persistence

pub mod cli;
pub mod conductor;
pub mod config;
pub mod cycles;
pub mod events;
pub mod integrations;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod stages;
pub mod state;
pub mod watcher;

// Re-export commonly used types
pub use conductor::{
    Conductor, ConductorConfig, ConductorReport, MissionOutcome, RestartReason, classify_error, format_error_message,
    format_fatal_message, format_restart_message,
};
pub use config::Config;
pub use cycles::CycleManager;
pub use events::{BusStats, Event, EventKind, IntegrationBus, IntegrationHandler, IntegrationPriority};
pub use llm::{CliDriver, LlmDriver, LlmInvocation};
pub use orchestrator::Orchestrator;
pub use prompts::{CodeMemory, KnowledgeSource, Learning, MemorySnippet, PromptFactory};
pub use stages::{Stage, StageContext, StageHandler, StageRegistry, StageRestrictions, StageResult};
pub use state::{MissionRecord, StateError, StateStore};
pub use watcher::{
    ContextWatcher, ExhaustionThresholds, HandoffEntry, HandoffLevel, HandoffSignal, TokenState, WatcherConfig,
    append_handoff, count_sections,
};
