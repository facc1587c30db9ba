//! Conductor - the outer loop driving a mission turn by turn
//!
//! Each turn: build the prompt, watch the live transcript, invoke the
//! LLM, then act on what came back. Handoff signals observed during the
//! call are authoritative over the reply; classified errors either
//! restart for free (graceful), consume the retry budget (retriable),
//! or halt the mission (blocking).

pub mod errors;

pub use errors::{RestartReason, classify_error, format_error_message, format_fatal_message, format_restart_message};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::llm::LlmDriver;
use crate::orchestrator::Orchestrator;
use crate::stages::Stage;
use crate::watcher::{ContextWatcher, HandoffCallback, HandoffEntry, HandoffLevel, HandoffSignal, append_handoff};

/// Conductor settings
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// Retriable-error budget; graceful restarts do not consume it
    pub max_restarts: u32,
    /// Per-turn LLM timeout
    pub turn_timeout: Duration,
    /// Hard ceiling on turns, a backstop against non-advancing loops
    pub max_turns: u32,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            turn_timeout: Duration::from_secs(3600),
            max_turns: 500,
        }
    }
}

/// How a mission run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissionOutcome {
    /// Reached COMPLETE
    Completed,
    /// Halted on a blocking error or an exhausted retry budget
    Halted { reason: RestartReason, message: String },
    /// Hit the turn ceiling
    TurnLimit,
}

/// Summary of a finished run
#[derive(Clone, Debug)]
pub struct ConductorReport {
    pub outcome: MissionOutcome,
    pub turns: u32,
    pub graceful_restarts: u32,
    pub errors_consumed: u32,
}

/// Sequential driver for a single mission
pub struct Conductor {
    orchestrator: Orchestrator,
    llm: Arc<dyn LlmDriver>,
    watcher: Arc<ContextWatcher>,
    config: ConductorConfig,
    /// Signal observed during the in-flight LLM call, if any
    signal_slot: Arc<Mutex<Option<HandoffSignal>>>,
}

impl Conductor {
    pub fn new(
        orchestrator: Orchestrator,
        llm: Arc<dyn LlmDriver>,
        watcher: Arc<ContextWatcher>,
        config: ConductorConfig,
    ) -> Self {
        Self {
            orchestrator,
            llm,
            watcher,
            config,
            signal_slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn take_signal(&self) -> Option<HandoffSignal> {
        self.signal_slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn signal_callback(&self) -> HandoffCallback {
        let slot = self.signal_slot.clone();
        Arc::new(move |signal| {
            // Record and return; the conductor reacts on its next loop
            // iteration
            let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            guard.get_or_insert(signal);
        })
    }

    /// Drive the mission until COMPLETE, a halt, or the turn ceiling
    pub async fn run(&mut self) -> eyre::Result<ConductorReport> {
        let workspace = self.orchestrator.workspace_dir();
        let mut restarts_left = self.config.max_restarts;
        let mut turns = 0u32;
        let mut graceful_restarts = 0u32;

        self.orchestrator.begin_mission()?;

        loop {
            let stage = self.orchestrator.current_stage();
            if stage == Stage::Complete {
                info!(turns, graceful_restarts, "Mission complete");
                return Ok(ConductorReport {
                    outcome: MissionOutcome::Completed,
                    turns,
                    graceful_restarts,
                    errors_consumed: self.config.max_restarts - restarts_left,
                });
            }
            if turns >= self.config.max_turns {
                warn!(max_turns = self.config.max_turns, "Turn ceiling reached, stopping");
                return Ok(ConductorReport {
                    outcome: MissionOutcome::TurnLimit,
                    turns,
                    graceful_restarts,
                    errors_consumed: self.config.max_restarts - restarts_left,
                });
            }
            turns += 1;

            let prompt = self.orchestrator.build_prompt(None);
            debug!(turn = turns, %stage, prompt_chars = prompt.len(), "Invoking LLM");

            *self.signal_slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
            let session = self.watcher.start_watching(&workspace, self.signal_callback(), true);

            let outcome = self.llm.invoke(&prompt, self.config.turn_timeout).await;

            if let Some(id) = &session {
                self.watcher.stop_watching(id);
            }

            // A handoff signal observed during the call wins over the
            // reply, however well-formed the reply is
            if let Some(signal) = self.take_signal() {
                if signal.level == HandoffLevel::Emergency {
                    warn!("Emergency handoff: killing in-flight LLM process");
                    self.llm.kill_in_flight();
                }
                self.record_handoff(&workspace, &signal, stage)?;
                graceful_restarts += 1;
                continue;
            }

            if outcome.is_error() {
                let (reason, explanation) = classify_error(&outcome.error, outcome.text.as_deref());

                if reason.is_graceful() {
                    info!("{}", format_restart_message(reason, &explanation));
                    graceful_restarts += 1;
                    continue;
                }
                if reason.is_blocking() {
                    let message = format_fatal_message(reason, &explanation, self.config.max_restarts);
                    error!("{message}");
                    return Ok(ConductorReport {
                        outcome: MissionOutcome::Halted { reason, message },
                        turns,
                        graceful_restarts,
                        errors_consumed: self.config.max_restarts - restarts_left,
                    });
                }

                let attempt = self.config.max_restarts - restarts_left;
                warn!(
                    "{}",
                    format_error_message(reason, &explanation, attempt, self.config.max_restarts)
                );
                restarts_left -= 1;
                if restarts_left == 0 {
                    let message = format_fatal_message(reason, &explanation, self.config.max_restarts);
                    error!("{message}");
                    return Ok(ConductorReport {
                        outcome: MissionOutcome::Halted { reason, message },
                        turns,
                        graceful_restarts,
                        errors_consumed: self.config.max_restarts,
                    });
                }
                continue;
            }

            let reply = parse_reply(outcome.text.as_deref().unwrap_or_default());
            let next = self.orchestrator.process_response(reply.clone())?;

            if stage == Stage::CycleEnd && next == Stage::Planning {
                let continuation = reply
                    .get("continuation_prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.orchestrator.advance_to_next_cycle(continuation)?;
            } else if next != stage {
                self.orchestrator.update_stage(next)?;
            }
        }
    }

    fn record_handoff(&mut self, workspace: &PathBuf, signal: &HandoffSignal, stage: Stage) -> eyre::Result<()> {
        let (reason, extra) = match signal.level {
            HandoffLevel::TimeBased => (
                RestartReason::TimeBasedHandoff,
                signal
                    .elapsed_minutes
                    .map(|m| format!("{m:.1} min"))
                    .unwrap_or_default(),
            ),
            _ => (
                RestartReason::ContextExhaustion,
                format!("cache_creation={}", signal.cache_creation),
            ),
        };
        info!("{}", format_restart_message(reason, &extra));

        let note = format!(
            "Handoff ({}) at iteration checkpoint: tokens_used={}, cache_read={}, cache_creation={}",
            signal.level.as_str(),
            signal.tokens_used,
            signal.cache_read,
            signal.cache_creation
        );
        let entry = HandoffEntry::new(self.orchestrator.mission_id(), stage.as_str(), note);
        if let Err(e) = append_handoff(workspace, &entry) {
            warn!(error = %e, "Failed to append handoff entry");
        }
        Ok(())
    }
}

/// Parse the agent's reply text into a JSON object
///
/// The reply may be raw JSON or prose with a JSON object embedded; an
/// unparseable reply degrades to an empty object (handlers treat
/// missing fields as an unexpected status).
pub fn parse_reply(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return value;
    }

    // Look for an embedded object
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
        && let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end])
        && value.is_object()
    {
        return value;
    }

    debug!(chars = text.len(), "Reply is not JSON, treating as empty object");
    json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_json() {
        let reply = parse_reply(r#"{"status": "plan_complete"}"#);
        assert_eq!(reply.get("status"), Some(&json!("plan_complete")));
    }

    #[test]
    fn test_parse_embedded_json() {
        let reply = parse_reply("Here is my answer:\n```json\n{\"status\": \"tests_passed\"}\n```\nDone.");
        assert_eq!(reply.get("status"), Some(&json!("tests_passed")));
    }

    #[test]
    fn test_parse_garbage_is_empty_object() {
        let reply = parse_reply("no json here");
        assert_eq!(reply, json!({}));
        assert_eq!(parse_reply(""), json!({}));
    }

    #[test]
    fn test_parse_non_object_json_is_empty_object() {
        assert_eq!(parse_reply("[1, 2, 3]"), json!({}));
        assert_eq!(parse_reply("\"string\""), json!({}));
    }
}
