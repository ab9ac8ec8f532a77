//! Agent loop configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the [`AgentCoordinator`](super::AgentCoordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum ReAct iterations before the loop is cut off.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// The identity paragraph opening every generated system prompt.
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Optional persona suffix appended after the identity.
    #[serde(default)]
    pub persona: String,
}

fn default_max_iterations() -> usize {
    5
}

fn default_identity() -> String {
    "You are Wisp, a private AI assistant running entirely on the user's device. \
     Nothing the user says leaves this device. Be concise, helpful, and direct."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            identity: default_identity(),
            persona: String::new(),
        }
    }
}
