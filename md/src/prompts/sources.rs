//! Narrow interfaces to the knowledge base and code memory
//!
//! Both subsystems live outside the engine; the prompt factory only
//! needs ranked lookups, so that is all these traits expose.

/// One learning retrieved from the knowledge base
#[derive(Clone, Debug)]
pub struct Learning {
    pub title: String,
    pub content: String,
    pub mission_id: String,
    pub category: String,
}

/// Ranked lookup of past-mission learnings
pub trait KnowledgeSource: Send + Sync {
    /// Learnings most relevant to the query, best first
    fn relevant_learnings(&self, query: &str, top_k: usize) -> eyre::Result<Vec<Learning>>;
}

/// One code snippet retrieved from episodic code memory
#[derive(Clone, Debug)]
pub struct MemorySnippet {
    pub file_path: String,
    pub snippet: String,
    pub context: String,
}

/// Ranked lookup of code snippets from recent work
pub trait CodeMemory: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> eyre::Result<Vec<MemorySnippet>>;
}
