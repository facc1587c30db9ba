//! Prompt assembly and context injection

mod factory;
mod sources;

pub use factory::{MISSION_MARKER, PromptFactory};
pub use sources::{CodeMemory, KnowledgeSource, Learning, MemorySnippet};
