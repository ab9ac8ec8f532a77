//! # wisp
//!
//! The inference-and-agent runtime of an on-device conversational AI
//! assistant. wisp drives a quantized GGUF model through llama.cpp (via
//! `llama-cpp-2`) and wraps it in a tool-augmented reasoning loop:
//!
//! 1. [`engine`] — loads the model, formats conversations into ChatML,
//!    evaluates tokens in batches, samples autoregressively, detects
//!    embedded `<tool_call>` markers, and yields a lazy [`TokenEvent`]
//!    stream with token-granular cancellation.
//! 2. [`agent`] — a bounded ReAct loop that consumes the token stream,
//!    dispatches tool calls through a [`ToolRegistry`], feeds results back
//!    into the conversation, and streams [`AgentEvent`]s to the observer.
//!
//! Everything else — chat UI, conversation persistence, model downloads,
//! concrete tool implementations — lives in the host application and talks
//! to wisp through [`Message`]s, the [`Tool`] contract, and the two event
//! streams.
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use wisp::{
//!     AgentConfig, AgentCoordinator, EngineConfig, GenerationParameters,
//!     InferenceEngine, Message, ToolRegistry,
//! };
//!
//! # async fn run() -> wisp::Result<()> {
//! let engine = Arc::new(InferenceEngine::new(EngineConfig::new(
//!     "/models/qwen2.5-3b-instruct-q4_k_m.gguf",
//! )));
//! engine.load().await?;
//!
//! let registry = Arc::new(ToolRegistry::new());
//! let agent = AgentCoordinator::new(engine, registry, AgentConfig::default());
//!
//! let mut events = agent.process(
//!     vec![Message::user("What's 2+2?")],
//!     GenerationParameters::default(),
//! );
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod conversation;
pub mod engine;
pub mod error;

pub use agent::{
    canonical_json, default_tool_specs, AgentConfig, AgentCoordinator, AgentEvent, AgentStream,
    FunctionTool, Tool, ToolError, ToolOutput, ToolRegistry, ToolSpec,
};
pub use conversation::{Message, Role, ToolCall, ToolResult};
pub use engine::{
    EngineConfig, EngineState, EngineStatus, FinishReason, GenerationParameters,
    GenerationSource, InferenceEngine, ModelInfo, TokenEvent, TokenStream,
};
pub use error::{Result, WispError};
