//! Prompt factory - assembles each turn's prompt with context injection
//!
//! Assembly order is fixed: ground rules, mission header, recent
//! history, the stage-specific body, then preferences and success
//! criteria. Knowledge-base, code-memory, and crash-recovery injections
//! are best-effort and never fail the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::integrations::RecoveryInfo;
use crate::stages::StageContext;
use crate::state::HistoryEntry;

use super::sources::{CodeMemory, KnowledgeSource, Learning, MemorySnippet};

/// Marker the injections splice around
pub const MISSION_MARKER: &str = "=== CURRENT MISSION ===";

const KB_TOP_K: usize = 5;
const KB_CONTENT_LIMIT: usize = 500;
const MEMORY_LIMIT: usize = 3;
const MEMORY_SNIPPET_LIMIT: usize = 1000;
const HISTORY_TAIL: usize = 10;

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Factory for generating stage prompts with context injection
pub struct PromptFactory {
    root: PathBuf,
    knowledge: Option<Arc<dyn KnowledgeSource>>,
    code_memory: Option<Arc<dyn CodeMemory>>,
    ground_rules_cache: Mutex<HashMap<String, String>>,
}

impl PromptFactory {
    /// Create a factory rooted at the engine's install directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            knowledge: None,
            code_memory: None,
            ground_rules_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_knowledge_source(mut self, source: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = Some(source);
        self
    }

    pub fn with_code_memory(mut self, memory: Arc<dyn CodeMemory>) -> Self {
        self.code_memory = Some(memory);
        self
    }

    /// Load ground rules for a provider, cached per provider
    ///
    /// Looks for `ground_rules/GROUND_RULES.<provider>.md` first, then
    /// the plain `GROUND_RULES.md` at the root. Absent files yield an
    /// empty string.
    pub fn ground_rules(&self, provider: &str) -> String {
        let mut cache = self.ground_rules_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(provider) {
            return cached.clone();
        }

        let candidates = [
            self.root
                .join("ground_rules")
                .join(format!("GROUND_RULES.{provider}.md")),
            self.root.join("GROUND_RULES.md"),
        ];

        let rules = candidates
            .iter()
            .find_map(|path| match std::fs::read_to_string(path) {
                Ok(content) => {
                    debug!(path = %path.display(), %provider, "Loaded ground rules");
                    Some(content)
                }
                Err(_) => None,
            })
            .unwrap_or_else(|| {
                debug!(%provider, "No ground rules file found");
                String::new()
            });

        cache.insert(provider.to_string(), rules.clone());
        rules
    }

    /// Assemble the full prompt for a stage
    pub fn assemble(&self, stage_prompt: &str, ctx: &StageContext, provider: &str) -> String {
        let mut parts: Vec<String> = Vec::new();

        let ground_rules = self.ground_rules(provider);
        if !ground_rules.is_empty() {
            parts.push("=== GROUND RULES (READ CAREFULLY) ===".to_string());
            parts.push(ground_rules);
            parts.push("=== END GROUND RULES ===".to_string());
            parts.push(String::new());
        }

        parts.push(MISSION_MARKER.to_string());
        parts.push(format!("MISSION: {}", ctx.problem_statement));
        parts.push(format!("CURRENT STAGE: {}", ctx.current_stage));
        parts.push(format!("ITERATION: {}", ctx.iteration));
        parts.push(format!("CYCLE: {} of {}", ctx.cycle_number, ctx.cycle_budget));
        parts.push(format!("WORKSPACE: {}", ctx.workspace_dir.display()));
        parts.push(String::new());

        if !ctx.history.is_empty() {
            parts.push("=== RECENT HISTORY ===".to_string());
            parts.push(format_history(&ctx.history, HISTORY_TAIL));
            parts.push(String::new());
        }

        parts.push(stage_prompt.to_string());

        if !ctx.preferences.is_empty() {
            parts.push(String::new());
            parts.push(format_preferences(&ctx.preferences));
        }

        if !ctx.success_criteria.is_empty() {
            parts.push(String::new());
            parts.push(format_success_criteria(&ctx.success_criteria));
        }

        parts.join("\n")
    }

    /// Inject knowledge-base learnings (PLANNING only)
    ///
    /// Best-effort: a source failure logs a warning and returns the
    /// prompt unchanged.
    pub fn inject_kb_context(&self, prompt: String, query: &str) -> String {
        let Some(source) = &self.knowledge else {
            return prompt;
        };

        let learnings = match source.relevant_learnings(query, KB_TOP_K) {
            Ok(learnings) => learnings,
            Err(e) => {
                warn!(error = %e, "Failed to inject knowledge base context");
                return prompt;
            }
        };

        if learnings.is_empty() {
            return prompt;
        }

        splice_before_mission(prompt, &format_kb_learnings(&learnings))
    }

    /// Inject code-memory snippets (BUILDING only); best-effort
    pub fn inject_code_memory(&self, prompt: String, query: &str) -> String {
        let Some(memory) = &self.code_memory else {
            return prompt;
        };

        let snippets = match memory.search(query, MEMORY_LIMIT) {
            Ok(snippets) => snippets,
            Err(e) => {
                warn!(error = %e, "Failed to inject code memory context");
                return prompt;
            }
        };

        if snippets.is_empty() {
            return prompt;
        }

        format!("{prompt}\n\n{}", format_memory_snippets(&snippets))
    }

    /// Splice a crash-recovery block in before the mission section
    pub fn inject_recovery_context(&self, prompt: String, info: &RecoveryInfo) -> String {
        splice_before_mission(prompt, &format_recovery(info))
    }
}

fn splice_before_mission(prompt: String, section: &str) -> String {
    match prompt.find(MISSION_MARKER) {
        Some(idx) => {
            let (head, tail) = prompt.split_at(idx);
            format!("{head}{section}\n{tail}")
        }
        None => format!("{prompt}\n\n{section}"),
    }
}

fn format_kb_learnings(learnings: &[Learning]) -> String {
    let mut lines = vec![
        "=== LEARNINGS FROM PAST MISSIONS ===".to_string(),
        String::new(),
        "The following learnings from previous missions may be relevant:".to_string(),
        String::new(),
    ];

    for learning in learnings {
        lines.push(format!(
            "**{}** [{}] (from {})",
            learning.title, learning.category, learning.mission_id
        ));
        lines.push(truncate(&learning.content, KB_CONTENT_LIMIT).to_string());
        lines.push(String::new());
    }

    lines.push("Consider these learnings when planning your approach.".to_string());
    lines.push(String::new());
    lines.join("\n")
}

fn format_memory_snippets(snippets: &[MemorySnippet]) -> String {
    let mut lines = vec![
        "=== CODE MEMORY ===".to_string(),
        String::new(),
        "Relevant code patterns from recent work:".to_string(),
        String::new(),
    ];

    for snippet in snippets {
        lines.push(format!("**{}**", snippet.file_path));
        if !snippet.context.is_empty() {
            lines.push(format!("Context: {}", snippet.context));
        }
        lines.push("```".to_string());
        lines.push(truncate(&snippet.snippet, MEMORY_SNIPPET_LIMIT).to_string());
        lines.push("```".to_string());
        lines.push(String::new());
    }

    lines.join("\n")
}

fn format_recovery(info: &RecoveryInfo) -> String {
    let mut lines = vec![
        "=== CRASH RECOVERY ===".to_string(),
        format!(
            "Your previous session crashed during the **{}** stage.",
            info.stage
        ),
        String::new(),
        format!("**Mission:** {}", info.mission_id),
        format!("**Iteration:** {}", info.iteration),
        format!("**Cycle:** {}", info.cycle),
        String::new(),
    ];

    if let Some(progress) = &info.progress {
        lines.push("**Progress at crash:**".to_string());
        lines.push(progress.clone());
        lines.push(String::new());
    }

    lines.push("IMPORTANT: Resume from where you left off. Do NOT restart from scratch.".to_string());
    lines.push("=== END CRASH RECOVERY ===".to_string());
    lines.push(String::new());
    lines.join("\n")
}

fn format_history(history: &[HistoryEntry], max_entries: usize) -> String {
    let start = history.len().saturating_sub(max_entries);
    history[start..]
        .iter()
        .map(|entry| {
            let event = truncate(&entry.event, 100);
            format!(
                "  [{}] {}: {}",
                entry.timestamp.format("%Y-%m-%dT%H:%M:%S"),
                entry.stage,
                event
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_preferences(preferences: &Map<String, Value>) -> String {
    let mut lines = vec!["User Preferences:".to_string()];
    for (key, value) in preferences {
        let name = key
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!("  - {name}: {rendered}"));
    }
    lines.join("\n")
}

fn format_success_criteria(criteria: &[String]) -> String {
    let mut lines = vec!["Success Criteria:".to_string()];
    for (i, criterion) in criteria.iter().enumerate() {
        lines.push(format!("  {}. {criterion}", i + 1));
    }
    lines.join("\n")
}
