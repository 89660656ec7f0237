// src/lib.rs

// Import the top-level `mcpscope` module.
pub mod mcpscope;

// Re-export the submodules at the crate root so callers write
// `mcpscope::agent::...` instead of `mcpscope::mcpscope::agent::...`.
pub use mcpscope::agent;
pub use mcpscope::event;
pub use mcpscope::llm;
pub use mcpscope::profile_store;
pub use mcpscope::protocol;
pub use mcpscope::proxy;
pub use mcpscope::resource_graph;
pub use mcpscope::resource_index;

// Re-exporting key items for easier external access.
pub use mcpscope::agent::{AgentConfig, AgentOrchestrator, AgentState, AgentStatus};
pub use mcpscope::event::{AgentEvent, AgentEventKind};
pub use mcpscope::llm::{LlmClient, Provider};
