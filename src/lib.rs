// === Public Modules (The Canonical Paths) ===
pub mod agent;
pub mod audio;
pub mod bus;
pub mod config;
pub mod document;
pub mod domain;
pub mod error;
pub mod negotiation;
pub mod panel;
pub mod payment;
pub mod phone;
pub mod profile;
pub mod room;
pub mod server;
pub mod stt;
pub mod trigger;
pub mod verification;

// === Private Implementation Details ===
mod llm;
mod macros;

// === Facades (Re-exporting internals) ===
// Expose the LLM seam and the concrete wire binding the composition root
// selects, without making the whole module public.
pub use crate::llm::http::HttpLlmProvider;
pub use crate::llm::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, LlmProvider, StopReason, ToolDefinition,
};
