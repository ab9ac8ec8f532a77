//! Agent loop: a bounded ReAct cycle around the inference engine.
//!
//! The coordinator consumes the engine's token stream, accumulates assistant
//! output, dispatches any tool calls through the registry, feeds results
//! back as new conversation messages, and iterates until the model answers
//! without calling tools (or the iteration cap is hit). Everything the
//! observer needs to render — text fragments, tool progress, completion — is
//! streamed as [`AgentEvent`]s.

mod catalog;
mod config;
mod coordinator;
mod tools;

use serde::{Deserialize, Serialize};

pub use catalog::{canonical_json, default_tool_specs, ToolSpec};
pub use config::AgentConfig;
pub use coordinator::{AgentCoordinator, AgentStream};
pub use tools::{FunctionTool, Tool, ToolError, ToolOutput, ToolRegistry};

/// An event on the coordinator's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A fragment of assistant text.
    Text { text: String },
    /// The model announced a tool call.
    ToolCallStarted { name: String },
    /// The named tool is about to execute.
    ToolExecuting { name: String },
    /// The named tool finished; `content` is its textual output.
    ToolResult { name: String, content: String },
    /// The run finished with a final assistant reply.
    Completed,
}
