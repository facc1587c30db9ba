//! Token observations and the context-exhaustion predicate
//!
//! Exhaustion shows up in the transcript as high
//! `cache_creation_input_tokens` with low `cache_read_input_tokens`:
//! the model is building fresh context at the wall instead of reusing
//! its cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observation of the LLM's token counters from a transcript line
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl TokenState {
    /// Total context the model is carrying for this request
    pub fn total_context(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }

    /// Parse a transcript line into a token observation
    ///
    /// Only `assistant` records carry a `message.usage` block; anything
    /// else (other record types, malformed JSON, missing usage) yields
    /// None and is skipped silently.
    pub fn from_transcript_line(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        if value.get("type").and_then(|v| v.as_str()) != Some("assistant") {
            return None;
        }
        let usage = value.get("message")?.get("usage")?;

        let field = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        Some(Self {
            input_tokens: field("input_tokens"),
            cache_read_input_tokens: field("cache_read_input_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
            output_tokens: field("output_tokens"),
            request_id: value
                .get("requestId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

/// Trigger level of a handoff
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffLevel {
    Graceful,
    Emergency,
    TimeBased,
}

impl HandoffLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffLevel::Graceful => "graceful",
            HandoffLevel::Emergency => "emergency",
            HandoffLevel::TimeBased => "time_based",
        }
    }
}

/// Signal delivered to the watcher callback when a handoff is due
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandoffSignal {
    pub level: HandoffLevel,
    pub session_id: String,
    pub workspace_path: std::path::PathBuf,
    pub tokens_used: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_minutes: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Context-exhaustion thresholds
///
/// GRACEFUL fires first so the agent can write its handoff notes;
/// EMERGENCY means kill immediately. Only low cache-read observations
/// count - a warm cache means the window is being reused, not exhausted.
#[derive(Clone, Copy, Debug)]
pub struct ExhaustionThresholds {
    pub graceful: u64,
    pub emergency: u64,
    pub low_cache_read: u64,
}

impl Default for ExhaustionThresholds {
    fn default() -> Self {
        Self {
            graceful: 130_000,
            emergency: 140_000,
            low_cache_read: 5_000,
        }
    }
}

impl ExhaustionThresholds {
    /// Evaluate the exhaustion predicate for one observation
    pub fn evaluate(&self, tokens: &TokenState) -> Option<HandoffLevel> {
        if tokens.cache_read_input_tokens >= self.low_cache_read {
            return None;
        }
        if tokens.cache_creation_input_tokens >= self.emergency {
            Some(HandoffLevel::Emergency)
        } else if tokens.cache_creation_input_tokens >= self.graceful {
            Some(HandoffLevel::Graceful)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(cache_creation: u64, cache_read: u64) -> TokenState {
        TokenState {
            cache_creation_input_tokens: cache_creation,
            cache_read_input_tokens: cache_read,
            ..Default::default()
        }
    }

    #[test]
    fn test_graceful_threshold() {
        let t = ExhaustionThresholds::default();
        assert_eq!(t.evaluate(&tokens(130_000, 100)), Some(HandoffLevel::Graceful));
        assert_eq!(t.evaluate(&tokens(135_000, 100)), Some(HandoffLevel::Graceful));
        assert_eq!(t.evaluate(&tokens(129_999, 100)), None);
    }

    #[test]
    fn test_emergency_threshold() {
        let t = ExhaustionThresholds::default();
        assert_eq!(t.evaluate(&tokens(140_000, 100)), Some(HandoffLevel::Emergency));
        assert_eq!(t.evaluate(&tokens(200_000, 0)), Some(HandoffLevel::Emergency));
    }

    #[test]
    fn test_cache_read_boundary_exact() {
        let t = ExhaustionThresholds::default();
        // The boundary is strict less-than: 4_999 fires, 5_000 does not
        assert_eq!(t.evaluate(&tokens(135_000, 4_999)), Some(HandoffLevel::Graceful));
        assert_eq!(t.evaluate(&tokens(135_000, 5_000)), None);
    }

    #[test]
    fn test_high_cache_read_never_fires() {
        let t = ExhaustionThresholds::default();
        // Cache hits mean the window is being reused - no false positive
        assert_eq!(t.evaluate(&tokens(500_000, 100_000)), None);
    }

    #[test]
    fn test_parse_assistant_line() {
        let line = r#"{"type":"assistant","requestId":"req-1","message":{"usage":{"input_tokens":12,"output_tokens":34,"cache_read_input_tokens":56,"cache_creation_input_tokens":78}}}"#;
        let tokens = TokenState::from_transcript_line(line).unwrap();
        assert_eq!(tokens.input_tokens, 12);
        assert_eq!(tokens.output_tokens, 34);
        assert_eq!(tokens.cache_read_input_tokens, 56);
        assert_eq!(tokens.cache_creation_input_tokens, 78);
        assert_eq!(tokens.request_id.as_deref(), Some("req-1"));
        assert_eq!(tokens.total_context(), 12 + 56 + 78);
    }

    #[test]
    fn test_parse_skips_non_assistant_and_malformed() {
        assert!(TokenState::from_transcript_line(r#"{"type":"user","message":{}}"#).is_none());
        assert!(TokenState::from_transcript_line(r#"{"type":"progress"}"#).is_none());
        assert!(TokenState::from_transcript_line("not json at all").is_none());
        assert!(TokenState::from_transcript_line(r#"{"type":"assistant"}"#).is_none());
    }

    #[test]
    fn test_parse_missing_usage_fields_default_to_zero() {
        let line = r#"{"type":"assistant","message":{"usage":{"input_tokens":5}}}"#;
        let tokens = TokenState::from_transcript_line(line).unwrap();
        assert_eq!(tokens.input_tokens, 5);
        assert_eq!(tokens.cache_creation_input_tokens, 0);
        assert!(tokens.request_id.is_none());
    }

    #[test]
    fn test_handoff_level_names() {
        assert_eq!(HandoffLevel::Graceful.as_str(), "graceful");
        assert_eq!(HandoffLevel::Emergency.as_str(), "emergency");
        assert_eq!(HandoffLevel::TimeBased.as_str(), "time_based");
    }
}
