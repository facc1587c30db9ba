//! Restart/failure classification for the conductor
//!
//! Maps raw error strings from the LLM driver to a closed taxonomy with
//! human-readable explanations. Three classes drive the outer loop:
//! graceful restarts never consume the budget, retriable errors consume
//! one attempt each, blocking errors halt the mission immediately.

use std::sync::OnceLock;

use regex::Regex;

/// Closed taxonomy of restart/failure reasons
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RestartReason {
    // === Graceful (don't count towards the limit) ===
    ContextExhaustion,
    TimeBasedHandoff,
    ContextOverflow,

    // === Retriable (count towards the limit) ===
    CliTimeout,
    ApiError500,
    ToolCallBug,
    OutputTooLong,
    CliCrash,
    NetworkError,
    Overloaded,

    // === Blocking (halt immediately) ===
    RateLimited,
    AuthFailed,
    InvalidRequest,

    Unknown,
}

impl RestartReason {
    /// Snake-case identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::ContextExhaustion => "context_exhaustion",
            RestartReason::TimeBasedHandoff => "time_based_handoff",
            RestartReason::ContextOverflow => "context_overflow",
            RestartReason::CliTimeout => "cli_timeout",
            RestartReason::ApiError500 => "api_error_500",
            RestartReason::ToolCallBug => "tool_call_bug",
            RestartReason::OutputTooLong => "output_too_long",
            RestartReason::CliCrash => "cli_crash",
            RestartReason::NetworkError => "network_error",
            RestartReason::Overloaded => "overloaded",
            RestartReason::RateLimited => "rate_limited",
            RestartReason::AuthFailed => "auth_failed",
            RestartReason::InvalidRequest => "invalid_request",
            RestartReason::Unknown => "unknown",
        }
    }

    /// Uppercase tag used in log prefixes
    pub fn tag(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    /// Graceful restarts are planned handoffs, not failures
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            RestartReason::ContextExhaustion | RestartReason::TimeBasedHandoff | RestartReason::ContextOverflow
        )
    }

    /// Blocking errors halt without retry
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            RestartReason::RateLimited | RestartReason::AuthFailed | RestartReason::InvalidRequest
        )
    }
}

fn reset_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"resets?\s+(?:at\s+)?(\d+[ap]m|\d+:\d+)").unwrap_or_else(|_| unreachable!()))
}

fn http_500_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(error|status|code)[:\s]*500").unwrap_or_else(|_| unreachable!()))
}

fn snippet(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn contains_pair(haystack: &str, pairs: &[(&str, &str)]) -> bool {
    pairs
        .iter()
        .any(|(a, b)| haystack.contains(a) && (b.is_empty() || haystack.contains(b)))
}

/// Classify an error string from the LLM driver
///
/// Total and deterministic: rules apply in order, first match wins.
/// `response_text` is folded in because some failures only surface in
/// the reply body (rate-limit notices in particular).
pub fn classify_error(error_info: &str, response_text: Option<&str>) -> (RestartReason, String) {
    let error_lower = error_info.to_lowercase();
    let response_lower = response_text.unwrap_or_default().to_lowercase();
    let combined = format!("{error_lower} {response_lower}");

    // Timeout prefix comes first - it is the most common failure
    if error_info.starts_with("timeout:") {
        return (
            RestartReason::CliTimeout,
            format!("LLM CLI did not respond within the timeout period ({error_info})"),
        );
    }

    // Rate limits
    let rate_limit_patterns = [
        "rate_limit",
        "rate limit",
        "ratelimit",
        "hit your limit",
        "too many requests",
        "429",
        "quota exceeded",
    ];
    if contains_any(&combined, &rate_limit_patterns) {
        let reset_time = reset_time_regex()
            .captures(&combined)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "later".to_string());
        return (
            RestartReason::RateLimited,
            format!("API rate limit reached. Resets at {reset_time}"),
        );
    }

    // Auth failures
    let auth_pairs = [
        ("authentication", "fail"),
        ("authentication", "error"),
        ("auth", "fail"),
        ("unauthorized", ""),
        ("401", ""),
        ("api key", "invalid"),
        ("api_key", "invalid"),
        ("session", "expired"),
    ];
    if contains_pair(&combined, &auth_pairs) {
        return (
            RestartReason::AuthFailed,
            "Authentication failed. Check API key or credentials".to_string(),
        );
    }

    // Malformed requests
    let invalid_patterns = ["invalid_request", "invalid request", "malformed", "bad request", "400"];
    if contains_any(&combined, &invalid_patterns) {
        return (
            RestartReason::InvalidRequest,
            format!("Invalid request. Check prompt format. Error: {}", snippet(error_info, 100)),
        );
    }

    // Known duplicate-tool-id CLI bug, then tool-call errors generally
    if combined.contains("tool_use") && combined.contains("ids must be unique") {
        return (
            RestartReason::ToolCallBug,
            "CLI bug: duplicate tool_use IDs. Consider updating the agent CLI".to_string(),
        );
    }
    let tool_patterns = ["tool_use_block", "invalid tool_use", "tool call", "function call"];
    if contains_any(&combined, &tool_patterns) && combined.contains("error") {
        return (
            RestartReason::ToolCallBug,
            format!("Tool call error detected. Error: {}", snippet(error_info, 100)),
        );
    }

    // Server-side 500s; a bare "500" only counts when clearly an HTTP
    // status, so token counts in error bodies don't alias
    let api_500_patterns = ["api error: 500", "api_error: 500", "internal server error", "server error"];
    if contains_any(&combined, &api_500_patterns)
        || http_500_regex().is_match(&combined)
        || combined.contains("http 500")
    {
        return (
            RestartReason::ApiError500,
            "API server error (500). Transient issue.".to_string(),
        );
    }

    if combined.contains("overloaded") || combined.contains("503") {
        return (
            RestartReason::Overloaded,
            "API is overloaded. Will retry after a brief pause.".to_string(),
        );
    }

    // Output token limit
    let output_pairs = [
        ("output token", "exceeded"),
        ("output token", "maximum"),
        ("max_tokens", "exceeded"),
        ("response", "too long"),
    ];
    if contains_pair(&combined, &output_pairs) {
        return (
            RestartReason::OutputTooLong,
            "Response exceeded the output token limit".to_string(),
        );
    }

    // Context overflow (non-caching providers and edge cases)
    let overflow_pairs = [
        ("maximum context length", "tokens"),
        ("context length", "exceeded"),
        ("context window", "exceeded"),
        ("too many tokens", ""),
        ("prompt is too long", ""),
    ];
    if contains_pair(&combined, &overflow_pairs) {
        return (
            RestartReason::ContextOverflow,
            "Context window exceeded for this model".to_string(),
        );
    }

    // Network failures
    let network_patterns = [
        "connection refused",
        "connection error",
        "network error",
        "socket error",
        "timeout error",
        "connect timeout",
        "read timeout",
        "econnrefused",
        "dns",
    ];
    if contains_any(&combined, &network_patterns) {
        return (
            RestartReason::NetworkError,
            format!("Network error communicating with API. Error: {}", snippet(error_info, 100)),
        );
    }

    // Generic CLI crash
    if let Some(stderr) = error_info.strip_prefix("cli_error:") {
        return (RestartReason::CliCrash, format!("Agent CLI error: {}", snippet(stderr, 100)));
    }

    // Generic exception
    if let Some(message) = error_info.strip_prefix("exception:") {
        return (RestartReason::Unknown, format!("Exception: {}", snippet(message, 100)));
    }

    let detail = if error_info.is_empty() {
        "No error information available".to_string()
    } else {
        snippet(error_info, 100)
    };
    (RestartReason::Unknown, format!("Unknown error: {detail}"))
}

/// `[ERROR:<REASON>] <explanation> (attempt k/N)` - attempt count only
/// for retriable errors
pub fn format_error_message(reason: RestartReason, explanation: &str, attempt: u32, max_attempts: u32) -> String {
    let prefix = format!("[ERROR:{}]", reason.tag());
    if reason.is_blocking() {
        format!("{prefix} {explanation}")
    } else {
        format!("{prefix} {explanation} (attempt {}/{max_attempts})", attempt + 1)
    }
}

/// `[FATAL] ...` - one line per halted mission
pub fn format_fatal_message(reason: RestartReason, explanation: &str, max_attempts: u32) -> String {
    if reason.is_blocking() {
        format!(
            "[FATAL] Mission halted due to blocking error: {} - {explanation}",
            reason.tag()
        )
    } else {
        format!(
            "[FATAL] Mission halted after {max_attempts} errors. Last error: {} - {explanation}",
            reason.tag()
        )
    }
}

/// `[RESTART:<REASON>] ...` - graceful handoff notice
pub fn format_restart_message(reason: RestartReason, extra_info: &str) -> String {
    let prefix = format!("[RESTART:{}]", reason.tag());
    let info = if extra_info.is_empty() {
        String::new()
    } else {
        format!(" ({extra_info})")
    };
    match reason {
        RestartReason::ContextExhaustion => format!("{prefix} Context limit reached{info}. Fresh instance starting..."),
        RestartReason::TimeBasedHandoff => format!("{prefix} Time limit reached{info}. Fresh instance starting..."),
        RestartReason::ContextOverflow => format!("{prefix} Context overflow detected{info}. Fresh instance starting..."),
        _ => format!("{prefix} Graceful handoff{info}. Fresh instance starting..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_prefix() {
        let (reason, explanation) = classify_error("timeout:60s", None);
        assert_eq!(reason, RestartReason::CliTimeout);
        assert!(explanation.contains("timeout:60s"));
        assert!(!reason.is_graceful());
        assert!(!reason.is_blocking());
    }

    #[test]
    fn test_rate_limit_phrases_are_blocking() {
        for text in [
            "rate limit exceeded",
            "you've hit your limit",
            "HTTP 429 too many requests",
            "quota exceeded for this org",
        ] {
            let (reason, _) = classify_error(text, None);
            assert_eq!(reason, RestartReason::RateLimited, "input {text:?}");
            assert!(reason.is_blocking());
        }
    }

    #[test]
    fn test_rate_limit_reset_time_extracted() {
        let (_, explanation) = classify_error("", Some("You've hit your limit. Resets at 11am."));
        assert_eq!(explanation, "API rate limit reached. Resets at 11am");

        let (_, explanation) = classify_error("cli_error:rate_limit_exceeded", None);
        assert_eq!(explanation, "API rate limit reached. Resets at later");

        let (_, explanation) = classify_error("rate limit; resets 9:30", None);
        assert!(explanation.contains("9:30"));
    }

    #[test]
    fn test_rate_limit_in_reply_text_only() {
        // Error string empty, the evidence is in the reply
        let (reason, _) = classify_error("", Some("sorry, rate limit"));
        assert_eq!(reason, RestartReason::RateLimited);
    }

    #[test]
    fn test_auth_failures() {
        for text in [
            "authentication failed",
            "401 unauthorized",
            "api key invalid",
            "session expired, run login",
        ] {
            let (reason, _) = classify_error(text, None);
            assert_eq!(reason, RestartReason::AuthFailed, "input {text:?}");
            assert!(reason.is_blocking());
        }
    }

    #[test]
    fn test_invalid_request() {
        let (reason, _) = classify_error("cli_error:400 bad request", None);
        assert_eq!(reason, RestartReason::InvalidRequest);
        assert!(reason.is_blocking());
    }

    #[test]
    fn test_tool_call_bug() {
        let (reason, explanation) =
            classify_error("cli_error:tool_use blocks: ids must be unique", None);
        assert_eq!(reason, RestartReason::ToolCallBug);
        assert!(explanation.contains("duplicate tool_use IDs"));
    }

    #[test]
    fn test_api_500_variants() {
        for text in [
            "api error: 500",
            "Internal Server Error",
            "error: 500",
            "http 500 from upstream",
            "status 500",
        ] {
            let (reason, _) = classify_error(text, None);
            assert_eq!(reason, RestartReason::ApiError500, "input {text:?}");
        }
    }

    #[test]
    fn test_bare_500_does_not_alias() {
        // A number containing 500 without the HTTP context is unknown,
        // not a server error
        let (reason, _) = classify_error("exception:processed 1500 rows", None);
        assert_eq!(reason, RestartReason::Unknown);
    }

    #[test]
    fn test_overloaded() {
        let (reason, _) = classify_error("cli_error:overloaded_error", None);
        assert_eq!(reason, RestartReason::Overloaded);
        let (reason, _) = classify_error("got 503 from api", None);
        assert_eq!(reason, RestartReason::Overloaded);
    }

    #[test]
    fn test_output_too_long() {
        let (reason, _) = classify_error("", Some("output token maximum exceeded"));
        assert_eq!(reason, RestartReason::OutputTooLong);
    }

    #[test]
    fn test_context_overflow_is_graceful() {
        let (reason, _) = classify_error("", Some("maximum context length is 200000 tokens"));
        assert_eq!(reason, RestartReason::ContextOverflow);
        assert!(reason.is_graceful());

        let (reason, _) = classify_error("cli_error:prompt is too long", None);
        assert_eq!(reason, RestartReason::ContextOverflow);
    }

    #[test]
    fn test_network_errors() {
        for text in ["connection refused", "DNS resolution failed", "socket error"] {
            let (reason, _) = classify_error(text, None);
            assert_eq!(reason, RestartReason::NetworkError, "input {text:?}");
        }
    }

    #[test]
    fn test_cli_crash_prefix() {
        let (reason, explanation) = classify_error("cli_error:segfault in renderer", None);
        assert_eq!(reason, RestartReason::CliCrash);
        assert!(explanation.contains("segfault in renderer"));
    }

    #[test]
    fn test_exception_prefix_is_unknown() {
        let (reason, explanation) = classify_error("exception:index out of range", None);
        assert_eq!(reason, RestartReason::Unknown);
        assert!(explanation.contains("index out of range"));
    }

    #[test]
    fn test_empty_error_is_unknown() {
        let (reason, explanation) = classify_error("", None);
        assert_eq!(reason, RestartReason::Unknown);
        assert!(explanation.contains("No error information available"));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let a = classify_error("cli_error:overloaded", Some("reply"));
        let b = classify_error("cli_error:overloaded", Some("reply"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_graceful_set() {
        assert!(RestartReason::ContextExhaustion.is_graceful());
        assert!(RestartReason::TimeBasedHandoff.is_graceful());
        assert!(RestartReason::ContextOverflow.is_graceful());
        assert!(!RestartReason::CliTimeout.is_graceful());
        assert!(!RestartReason::Unknown.is_graceful());
    }

    #[test]
    fn test_unknown_is_retriable() {
        assert!(!RestartReason::Unknown.is_graceful());
        assert!(!RestartReason::Unknown.is_blocking());
    }

    #[test]
    fn test_format_error_message() {
        assert_eq!(
            format_error_message(RestartReason::RateLimited, "Resets at 11am", 0, 3),
            "[ERROR:RATE_LIMITED] Resets at 11am"
        );
        assert_eq!(
            format_error_message(RestartReason::CliTimeout, "60s timeout", 1, 3),
            "[ERROR:CLI_TIMEOUT] 60s timeout (attempt 2/3)"
        );
    }

    #[test]
    fn test_format_fatal_message() {
        let blocking = format_fatal_message(RestartReason::RateLimited, "Resets at 11am", 3);
        assert!(blocking.starts_with("[FATAL]"));
        assert!(blocking.contains("RATE_LIMITED"));

        let exhausted = format_fatal_message(RestartReason::CliTimeout, "60s timeout", 3);
        assert!(exhausted.contains("after 3 errors"));
        assert!(exhausted.contains("CLI_TIMEOUT"));
    }

    #[test]
    fn test_format_restart_message() {
        let msg = format_restart_message(RestartReason::ContextExhaustion, "135K tokens");
        assert_eq!(
            msg,
            "[RESTART:CONTEXT_EXHAUSTION] Context limit reached (135K tokens). Fresh instance starting..."
        );
        let msg = format_restart_message(RestartReason::TimeBasedHandoff, "55.2 min");
        assert!(msg.contains("Time limit reached (55.2 min)"));
    }
}
