//! Observable engine state.
//!
//! Hosts need to reflect what the engine is doing (a spinner while loading,
//! a stop button while generating) without polling the engine itself. The
//! current state lives in an atomic the UI can read at any time, and every
//! transition is also pushed over a broadcast channel for reactive
//! listeners. Slow subscribers only ever lose intermediate transitions, not
//! the latest state.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the state-change broadcast channel.
const NOTIFY_CAPACITY: usize = 16;

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No model loaded.
    Idle,
    /// `load()` is in flight.
    Loading,
    /// A model is loaded and the engine is ready to generate.
    Loaded,
    /// A generation is in flight.
    Generating,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Loading,
            2 => EngineState::Loaded,
            3 => EngineState::Generating,
            _ => EngineState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Loading => 1,
            EngineState::Loaded => 2,
            EngineState::Generating => 3,
        }
    }
}

/// Atomic current-state cell plus a transition broadcast.
pub struct EngineStatus {
    state: AtomicU8,
    notify: broadcast::Sender<EngineState>,
}

impl EngineStatus {
    pub(crate) fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: AtomicU8::new(EngineState::Idle.as_u8()),
            notify,
        }
    }

    /// The current state, readable from any thread.
    pub fn current(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineState> {
        self.notify.subscribe()
    }

    pub(crate) fn set(&self, state: EngineState) {
        let previous = EngineState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if previous != state {
            tracing::debug!("engine state: {previous:?} -> {state:?}");
            let _ = self.notify.send(state);
        }
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}
