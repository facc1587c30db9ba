//! LLM driver abstraction
//!
//! The engine sees the LLM as an opaque function of one prompt: text
//! plus usage out, or an error string following a small grammar
//! (`timeout:<secs>s`, `cli_error:<stderr>`, `exception:<message>`,
//! empty on success).

mod cli_driver;

pub use cli_driver::CliDriver;

use std::time::Duration;

use async_trait::async_trait;

/// Outcome of one LLM invocation
#[derive(Clone, Debug)]
pub struct LlmInvocation {
    /// Reply text when the call produced output
    pub text: Option<String>,
    /// Error string per the driver grammar; empty on success
    pub error: String,
}

impl LlmInvocation {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            text: None,
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// One-shot LLM invocation - each call is an independent conversation
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Invoke the LLM with a prompt, bounded by a timeout
    async fn invoke(&self, prompt: &str, timeout: Duration) -> LlmInvocation;

    /// Kill an in-flight invocation (emergency handoff)
    fn kill_in_flight(&self) {}
}
