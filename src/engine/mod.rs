//! Native inference engine built on llama.cpp (via `llama-cpp-2`).
//!
//! The engine owns a quantized GGUF model and its context, runs prefill and
//! autoregressive decode on a dedicated worker thread, and streams
//! [`TokenEvent`]s to the caller. Tool-call markers embedded in the model's
//! output are detected on the fly and surfaced as structured [`ToolCall`]s
//! instead of raw text.
//!
//! [`ToolCall`]: crate::conversation::ToolCall

pub(crate) mod backend;
mod native;
pub mod profile;
mod prompt;
mod sampler;
mod status;
mod stream;
mod tool_call;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::conversation::{Message, ToolCall};
use crate::error::Result;

pub use native::InferenceEngine;
pub use status::{EngineState, EngineStatus};
pub use stream::TokenStream;

/// Why a generation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model emitted an end-of-generation token.
    Stop,
    /// The `max_tokens` budget was exhausted.
    Length,
    /// The model ended its turn on an open tool-call buffer.
    ToolUse,
    /// The cancel flag was observed.
    Cancelled,
}

/// A single event on the engine's token stream.
///
/// The terminal `Done` is always the last event of a generation; nothing
/// follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenEvent {
    /// A decoded piece of UTF-8 text; may be a partial code point.
    Token { text: String },
    /// A complete tool call parsed out of a `<tool_call>` marker block.
    ToolCall { call: ToolCall },
    /// The generation finished.
    Done { reason: FinishReason },
}

/// Sampling and budget knobs for a single generation call.
///
/// All numeric fields are clamped at `generate()` entry via [`clamped`].
///
/// [`clamped`]: GenerationParameters::clamped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Sampling temperature, clamped to `[0.01, 2.0]`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus sampling threshold, clamped to `[0.0, 1.0]`.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Top-k truncation, clamped to `>= 1`.
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    /// Maximum number of tokens to generate, clamped to `>= 1`.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Repetition penalty over the last 64 tokens, clamped to `[1.0, 2.0]`.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// Sequences that end the generation when they appear in the output.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> i32 {
    40
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_repeat_penalty() -> f32 {
    1.1
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
            repeat_penalty: default_repeat_penalty(),
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationParameters {
    /// The normal form every generation actually runs with.
    pub fn clamped(&self) -> Self {
        Self {
            temperature: self.temperature.clamp(0.01, 2.0),
            top_p: self.top_p.clamp(0.0, 1.0),
            top_k: self.top_k.max(1),
            max_tokens: self.max_tokens.max(1),
            repeat_penalty: self.repeat_penalty.clamp(1.0, 2.0),
            stop_sequences: self.stop_sequences.clone(),
        }
    }
}

/// Static configuration for an [`InferenceEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the quantized GGUF weights file.
    pub model_path: PathBuf,
    /// Requested context window; the engine loads with `max(512, context_size)`.
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Number of model layers to offload to GPU (0 = CPU-only, 9999 = all).
    #[serde(default)]
    pub gpu_offload_layers: u32,
    /// Default sampling temperature for generations on this engine.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Default nucleus threshold for generations on this engine.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Fixed sampler seed; `None` draws a fresh seed per generation.
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_context_size() -> u32 {
    4096
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the path.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: default_context_size(),
            gpu_offload_layers: 0,
            temperature: default_temperature(),
            top_p: default_top_p(),
            seed: None,
        }
    }

    /// Generation parameters seeded from this engine's defaults.
    pub fn default_parameters(&self) -> GenerationParameters {
        GenerationParameters {
            temperature: self.temperature,
            top_p: self.top_p,
            ..GenerationParameters::default()
        }
    }

    /// Sizes `gpu_offload_layers` from the detected GPU and the weights
    /// file's on-disk size, for `layer_count` transformer layers. Leaves the
    /// engine on the CPU when no GPU is present or the model can't
    /// meaningfully fit.
    pub fn with_auto_gpu_offload(mut self, layer_count: u32) -> Self {
        self.gpu_offload_layers = profile::offload_for_model(&self.model_path, layer_count);
        self
    }
}

/// Metadata about a successfully loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    /// Path the model was loaded from.
    pub path: PathBuf,
    /// Vocabulary size.
    pub vocab_size: i32,
    /// Context length the model was trained with.
    pub training_context: u32,
    /// Total parameter count.
    pub parameter_count: u64,
    /// On-disk size of the weights in bytes.
    pub size_bytes: u64,
}

/// The seam the agent coordinator drives generations through.
///
/// [`InferenceEngine`] is the production implementation; tests script fakes.
pub trait GenerationSource: Send + Sync {
    /// Starts a generation over the given conversation, returning the lazy
    /// token stream. Fails fast when another generation is in flight.
    fn generate(
        &self,
        messages: &[Message],
        parameters: &GenerationParameters,
    ) -> Result<TokenStream>;

    /// Sets the engine's cancel flag; observed at token granularity.
    fn request_cancel(&self);
}
