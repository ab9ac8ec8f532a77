//! Process-wide llama.cpp backend lifecycle.
//!
//! `llama_backend_init` / `llama_backend_free` must be called exactly once
//! per process lifetime of the backend, and the pair is not thread-safe in
//! the native library. A lock-guarded refcount gates both calls: the first
//! acquirer initializes, the last releaser tears down. This lets multiple
//! engines coexist and load/unload independently.

use std::sync::{Arc, Mutex};

use llama_cpp_2::llama_backend::LlamaBackend;

use crate::error::WispError;

struct BackendGate {
    refcount: usize,
    backend: Option<Arc<LlamaBackend>>,
}

static GATE: Mutex<BackendGate> = Mutex::new(BackendGate {
    refcount: 0,
    backend: None,
});

/// Acquires a handle on the shared backend, initializing it on 0 -> 1.
pub(crate) fn acquire() -> Result<Arc<LlamaBackend>, WispError> {
    let mut gate = GATE.lock().expect("backend gate poisoned");
    let backend = match gate.backend.clone() {
        Some(existing) => existing,
        None => {
            let fresh = Arc::new(LlamaBackend::init().map_err(|e| {
                WispError::FailedToLoad(format!("llama backend init failed: {e}"))
            })?);
            tracing::info!("llama backend initialized");
            gate.backend = Some(fresh.clone());
            fresh
        }
    };
    gate.refcount += 1;
    Ok(backend)
}

/// Releases one handle, freeing the backend on 1 -> 0.
///
/// The caller must have dropped its `Arc` first so the free actually runs
/// here rather than at some later drop site.
pub(crate) fn release() {
    let mut gate = GATE.lock().expect("backend gate poisoned");
    if gate.refcount == 0 {
        tracing::warn!("backend release without a matching acquire");
        return;
    }
    gate.refcount -= 1;
    if gate.refcount == 0 {
        gate.backend = None;
        tracing::info!("llama backend freed");
    }
}

/// Current number of outstanding acquisitions.
#[cfg(test)]
pub(crate) fn refcount() -> usize {
    GATE.lock().expect("backend gate poisoned").refcount
}

#[cfg(test)]
mod tests {
    use super::*;

    // The gate is process-global, so this single test exercises the whole
    // acquire/release protocol to avoid interleaving with itself.
    #[test]
    fn test_refcount_round_trip() {
        let start = refcount();

        let first = acquire().expect("first acquire");
        assert_eq!(refcount(), start + 1);

        let second = acquire().expect("second acquire");
        assert_eq!(refcount(), start + 2);

        drop(second);
        release();
        assert_eq!(refcount(), start + 1);

        drop(first);
        release();
        assert_eq!(refcount(), start);
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let start = refcount();
        if start == 0 {
            release();
            assert_eq!(refcount(), 0);
        }
    }
}
