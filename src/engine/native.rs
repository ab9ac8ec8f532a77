//! The inference engine proper.
//!
//! `LlamaModel` and `LlamaContext` hold raw pointers that are not `Send`, so
//! all llama.cpp state lives on a dedicated worker thread and the engine
//! handle talks to it over a command channel. The context is created once at
//! `load()` and reused across generations with a KV-cache clear, which is
//! what keeps time-to-first-token low.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use tokio::sync::{mpsc, oneshot};

use super::status::{EngineState, EngineStatus};
use super::stream::EVENT_CHANNEL_CAPACITY;
use super::tool_call::{Scanned, ToolCallScanner};
use super::{
    backend, prompt, sampler, EngineConfig, FinishReason, GenerationParameters, GenerationSource,
    ModelInfo, TokenEvent, TokenStream,
};
use crate::conversation::Message;
use crate::error::{Result, WispError};

/// Tokens per prefill batch; also the context's `n_batch`.
const BATCH_SIZE: u32 = 512;

/// Floor for the context window regardless of configuration.
const MIN_CONTEXT: u32 = 512;

/// llama.cpp flash-attention policy: -1 = auto, 0 = disabled, 1 = enabled.
const FLASH_ATTN_ENABLED: i32 = 1;

type EventSender = mpsc::Sender<std::result::Result<TokenEvent, WispError>>;

enum WorkerCommand {
    Load {
        config: EngineConfig,
        ack: oneshot::Sender<Result<ModelInfo>>,
    },
    Generate {
        messages: Vec<Message>,
        parameters: GenerationParameters,
        seed: Option<u32>,
        events: EventSender,
        cancel: Arc<AtomicBool>,
        in_flight: Arc<AtomicBool>,
        status: Arc<EngineStatus>,
    },
    Unload {
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle on a single loaded model and its context.
///
/// Exactly one generation may be in flight per engine; concurrent
/// `generate()` calls fail fast. `load()` / `unload()` may be repeated.
pub struct InferenceEngine {
    config: EngineConfig,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    worker: Option<std::thread::JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    loaded: Arc<AtomicBool>,
    status: Arc<EngineStatus>,
    info: std::sync::Mutex<Option<ModelInfo>>,
}

impl InferenceEngine {
    /// Creates an idle engine; no resources are acquired until [`load`].
    ///
    /// [`load`]: InferenceEngine::load
    pub fn new(config: EngineConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = std::thread::spawn(move || worker_main(command_rx));
        Self {
            config,
            commands,
            worker: Some(worker),
            cancel: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
            loaded: Arc::new(AtomicBool::new(false)),
            status: Arc::new(EngineStatus::new()),
            info: std::sync::Mutex::new(None),
        }
    }

    /// Whether a model is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Observable engine state: readable atomically, subscribable for
    /// transitions.
    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    /// Metadata of the loaded model, if any.
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.info.lock().expect("model info poisoned").clone()
    }

    /// Acquires the backend, loads the model, and creates the context.
    ///
    /// The heavy work runs on the worker thread; this only awaits the ack.
    /// Failure at any step releases everything acquired before it.
    pub async fn load(&self) -> Result<ModelInfo> {
        if self.loaded.load(Ordering::Acquire) {
            return Err(WispError::FailedToLoad(
                "a model is already loaded; unload it first".into(),
            ));
        }
        if !self.config.model_path.exists() {
            return Err(WispError::ModelNotFound(
                self.config.model_path.display().to_string(),
            ));
        }

        self.status.set(EngineState::Loading);
        let (ack, ack_rx) = oneshot::channel();
        let result: Result<ModelInfo> = async {
            self.commands
                .send(WorkerCommand::Load {
                    config: self.config.clone(),
                    ack,
                })
                .map_err(|_| WispError::FailedToLoad("inference worker terminated".into()))?;
            ack_rx
                .await
                .map_err(|_| WispError::FailedToLoad("inference worker terminated".into()))?
        }
        .await;

        match result {
            Ok(info) => {
                self.loaded.store(true, Ordering::Release);
                *self.info.lock().expect("model info poisoned") = Some(info.clone());
                self.status.set(EngineState::Loaded);
                Ok(info)
            }
            Err(e) => {
                self.status.set(EngineState::Idle);
                Err(e)
            }
        }
    }

    /// Releases the context, then the model, then the backend refcount.
    pub async fn unload(&self) -> Result<()> {
        if !self.loaded.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Unload { ack })
            .map_err(|_| WispError::FailedToLoad("inference worker terminated".into()))?;
        ack_rx
            .await
            .map_err(|_| WispError::FailedToLoad("inference worker terminated".into()))?;
        *self.info.lock().expect("model info poisoned") = None;
        self.status.set(EngineState::Idle);
        tracing::info!("model unloaded");
        Ok(())
    }

    /// Starts a generation, returning its lazy [`TokenStream`].
    ///
    /// The producer runs detached on the worker thread; dropping the stream
    /// cancels it at token granularity.
    pub fn generate(
        &self,
        messages: &[Message],
        parameters: &GenerationParameters,
    ) -> Result<TokenStream> {
        if !self.loaded.load(Ordering::Acquire) {
            return Err(WispError::ModelNotLoaded);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WispError::GenerationFailed(
                "generation already in progress".into(),
            ));
        }
        self.cancel.store(false, Ordering::Release);
        self.status.set(EngineState::Generating);

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let command = WorkerCommand::Generate {
            messages: messages.to_vec(),
            parameters: parameters.clamped(),
            seed: self.config.seed,
            events,
            cancel: self.cancel.clone(),
            in_flight: self.in_flight.clone(),
            status: self.status.clone(),
        };
        if self.commands.send(command).is_err() {
            self.in_flight.store(false, Ordering::Release);
            self.status.set(EngineState::Loaded);
            return Err(WispError::GenerationFailed(
                "inference worker terminated".into(),
            ));
        }
        Ok(TokenStream::new(rx, self.cancel.clone()))
    }

    /// Sets the cancel flag shared with the decode loop. Idempotent.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl GenerationSource for InferenceEngine {
    fn generate(
        &self,
        messages: &[Message],
        parameters: &GenerationParameters,
    ) -> Result<TokenStream> {
        InferenceEngine::generate(self, messages, parameters)
    }

    fn request_cancel(&self) {
        InferenceEngine::request_cancel(self);
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker thread: owns all llama.cpp state
// ---------------------------------------------------------------------------

struct WorkerState {
    backend: Option<Arc<LlamaBackend>>,
    model: Option<LlamaModel>,
    // Borrows `model`; the lifetime is erased and drop order enforced by
    // hand: the context is always cleared before the model slot.
    ctx: Option<LlamaContext<'static>>,
    n_ctx: u32,
}

fn worker_main(mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut state = WorkerState {
        backend: None,
        model: None,
        ctx: None,
        n_ctx: 0,
    };

    while let Some(command) = commands.blocking_recv() {
        match command {
            WorkerCommand::Load { config, ack } => {
                let _ = ack.send(handle_load(&mut state, &config));
            }
            WorkerCommand::Generate {
                messages,
                parameters,
                seed,
                events,
                cancel,
                in_flight,
                status,
            } => {
                if let Err(e) = run_generation(&mut state, &messages, &parameters, seed, &events, &cancel)
                {
                    tracing::warn!("generation failed: {e}");
                    let _ = events.blocking_send(Err(e));
                }
                in_flight.store(false, Ordering::Release);
                status.set(EngineState::Loaded);
            }
            WorkerCommand::Unload { ack } => {
                release_state(&mut state);
                let _ = ack.send(());
            }
            WorkerCommand::Shutdown => break,
        }
    }

    release_state(&mut state);
}

/// Drops everything in reverse-acquire order: context, model, backend.
fn release_state(state: &mut WorkerState) {
    let had_backend = state.backend.is_some();
    state.ctx = None;
    state.model = None;
    state.n_ctx = 0;
    if let Some(backend) = state.backend.take() {
        // Our Arc must be gone before release() so a 1 -> 0 transition frees
        // the backend inside the gate rather than at a later drop site.
        drop(backend);
        backend::release();
    }
    if had_backend {
        tracing::debug!("engine resources released");
    }
}

fn handle_load(state: &mut WorkerState, config: &EngineConfig) -> Result<ModelInfo> {
    release_state(state);

    let load_start = Instant::now();
    let backend = backend::acquire()?;

    let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_offload_layers);
    let model = match LlamaModel::load_from_file(&backend, &config.model_path, &model_params) {
        Ok(m) => m,
        Err(e) => {
            drop(backend);
            backend::release();
            return Err(WispError::FailedToLoad(e.to_string()));
        }
    };

    let n_ctx = effective_context_size(config);
    let n_threads = worker_threads();
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(BATCH_SIZE)
        .with_n_threads(n_threads)
        .with_n_threads_batch(n_threads)
        .with_flash_attention_policy(FLASH_ATTN_ENABLED);

    // SAFETY: the context borrows the model. Both live in `WorkerState`,
    // which never moves (it is a local of `worker_main`), and every path
    // that clears or replaces the model slot drops the context first.
    let model_ref: &'static LlamaModel =
        unsafe { &*(state.model.insert(model) as *const LlamaModel) };

    let ctx = match model_ref.new_context(&backend, ctx_params) {
        Ok(c) => c,
        Err(e) => {
            state.model = None;
            drop(backend);
            backend::release();
            return Err(WispError::ContextCreationFailed(e.to_string()));
        }
    };

    let info = ModelInfo {
        path: config.model_path.clone(),
        vocab_size: model_ref.n_vocab(),
        training_context: model_ref.n_ctx_train(),
        parameter_count: model_ref.n_params() as u64,
        size_bytes: model_ref.size() as u64,
    };

    tracing::info!(
        "model loaded in {:?}: {} ({:.1}B params, n_ctx={}, threads={}, gpu_layers={})",
        load_start.elapsed(),
        config.model_path.display(),
        info.parameter_count as f64 / 1e9,
        n_ctx,
        n_threads,
        config.gpu_offload_layers,
    );

    state.ctx = Some(ctx);
    state.n_ctx = n_ctx;
    state.backend = Some(backend);
    Ok(info)
}

/// The context window actually created, floored at [`MIN_CONTEXT`].
fn effective_context_size(config: &EngineConfig) -> u32 {
    config.context_size.max(MIN_CONTEXT)
}

/// Thread count for llama.cpp: all cores minus headroom for the runtime.
fn worker_threads() -> i32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cores.saturating_sub(2).max(1) as i32
}

fn emit(events: &EventSender, event: TokenEvent) -> bool {
    events.blocking_send(Ok(event)).is_ok()
}

fn finish(events: &EventSender, reason: FinishReason) {
    let _ = events.blocking_send(Ok(TokenEvent::Done { reason }));
}

fn run_generation(
    state: &mut WorkerState,
    messages: &[Message],
    parameters: &GenerationParameters,
    seed: Option<u32>,
    events: &EventSender,
    cancel: &AtomicBool,
) -> Result<()> {
    let n_ctx = state.n_ctx;
    let model = state.model.as_ref().ok_or(WispError::ModelNotLoaded)?;
    let ctx = state.ctx.as_mut().ok_or(WispError::ModelNotLoaded)?;

    ctx.clear_kv_cache();

    let prompt = prompt::format_messages(messages);
    let tokens = model
        .str_to_token(&prompt, AddBos::Never)
        .map_err(|e| WispError::GenerationFailed(format!("tokenization failed: {e}")))?;
    if tokens.is_empty() {
        return Err(WispError::GenerationFailed(
            "tokenized prompt is empty".into(),
        ));
    }
    if tokens.len() as u32 >= n_ctx {
        return Err(WispError::GenerationFailed(format!(
            "prompt needs {} tokens but the context holds {}",
            tokens.len(),
            n_ctx
        )));
    }

    // Prefill in BATCH_SIZE chunks; only the very last prompt token carries
    // logits, for sampling the first generated token.
    let prefill_start = Instant::now();
    let mut batch = LlamaBatch::new(BATCH_SIZE as usize, 1);
    let last_index = tokens.len() - 1;
    for (chunk_index, chunk) in tokens.chunks(BATCH_SIZE as usize).enumerate() {
        if cancel.load(Ordering::Relaxed) {
            finish(events, FinishReason::Cancelled);
            return Ok(());
        }
        batch.clear();
        let offset = chunk_index * BATCH_SIZE as usize;
        for (i, token) in chunk.iter().enumerate() {
            let pos = offset + i;
            batch
                .add(*token, pos as i32, &[0], pos == last_index)
                .map_err(|e| WispError::GenerationFailed(format!("prefill batch add failed: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| WispError::GenerationFailed(format!("prefill decode failed: {e}")))?;
    }
    tracing::debug!(
        "prefill: {} tokens in {:?}",
        tokens.len(),
        prefill_start.elapsed()
    );

    let mut sampler = sampler::build(parameters, seed);
    let mut scanner = ToolCallScanner::new();
    let mut stops = StopScanner::new(&parameters.stop_sequences);
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let mut n_cur = tokens.len() as i32;
    let mut generated = 0u32;
    let decode_start = Instant::now();

    for _ in 0..parameters.max_tokens {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!("cancel observed after {generated} tokens");
            finish(events, FinishReason::Cancelled);
            return Ok(());
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            let reason = match scanner.flush() {
                Some(call) => {
                    if !emit(events, TokenEvent::ToolCall { call }) {
                        return Ok(());
                    }
                    FinishReason::ToolUse
                }
                None => FinishReason::Stop,
            };
            log_throughput(generated, decode_start);
            finish(events, reason);
            return Ok(());
        }

        generated += 1;
        let piece = match model.token_to_piece(token, &mut decoder, true, None) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("token piece decode failed: {e}");
                String::new()
            }
        };

        for item in scanner.feed(&piece) {
            match item {
                Scanned::Text(text) => {
                    let (to_emit, hit_stop) = stops.push(&text);
                    if !to_emit.is_empty() && !emit(events, TokenEvent::Token { text: to_emit }) {
                        return Ok(());
                    }
                    if hit_stop {
                        log_throughput(generated, decode_start);
                        finish(events, FinishReason::Stop);
                        return Ok(());
                    }
                }
                Scanned::Call(call) => {
                    if !emit(events, TokenEvent::ToolCall { call }) {
                        return Ok(());
                    }
                }
            }
        }

        batch.clear();
        batch
            .add(token, n_cur, &[0], true)
            .map_err(|e| WispError::GenerationFailed(format!("batch add failed: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| WispError::GenerationFailed(format!("decode failed at position {n_cur}: {e}")))?;
        n_cur += 1;
    }

    log_throughput(generated, decode_start);
    finish(events, FinishReason::Length);
    Ok(())
}

fn log_throughput(generated: u32, started: Instant) {
    if generated > 0 {
        let elapsed = started.elapsed();
        tracing::debug!(
            "generated {} tokens in {:?} ({:.1} t/s)",
            generated,
            elapsed,
            generated as f64 / elapsed.as_secs_f64().max(1e-6)
        );
    }
}

// ---------------------------------------------------------------------------
// Stop sequences
// ---------------------------------------------------------------------------

/// Watches the emitted (un-buffered) text for stop sequences.
///
/// Text is released as it arrives, so a stop sequence that begins in an
/// already-released piece still ends the generation but cannot retract the
/// released prefix.
struct StopScanner {
    stops: Vec<String>,
    max_len: usize,
    seen: String,
    emitted: usize,
}

impl StopScanner {
    fn new(stops: &[String]) -> Self {
        let stops: Vec<String> = stops.iter().filter(|s| !s.is_empty()).cloned().collect();
        let max_len = stops.iter().map(|s| s.len()).max().unwrap_or(0);
        Self {
            stops,
            max_len,
            seen: String::new(),
            emitted: 0,
        }
    }

    /// Feeds one text piece. Returns the emittable portion and whether a
    /// stop sequence was hit (ending the generation).
    fn push(&mut self, piece: &str) -> (String, bool) {
        if self.stops.is_empty() {
            return (piece.to_string(), false);
        }

        self.seen.push_str(piece);

        // Rescan from just before the already-emitted boundary so a stop
        // spanning two pieces is still found.
        let mut from = self.emitted.saturating_sub(self.max_len.saturating_sub(1));
        while from > 0 && !self.seen.is_char_boundary(from) {
            from -= 1;
        }

        let mut hit: Option<usize> = None;
        for stop in &self.stops {
            if let Some(rel) = self.seen[from..].find(stop.as_str()) {
                let abs = from + rel;
                hit = Some(hit.map_or(abs, |h| h.min(abs)));
            }
        }

        match hit {
            Some(idx) => {
                let emit = if idx > self.emitted {
                    self.seen[self.emitted..idx].to_string()
                } else {
                    String::new()
                };
                self.emitted = self.seen.len();
                (emit, true)
            }
            None => {
                let emit = self.seen[self.emitted..].to_string();
                self.emitted = self.seen.len();
                (emit, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> InferenceEngine {
        InferenceEngine::new(EngineConfig::new("/nonexistent/model.gguf"))
    }

    #[tokio::test]
    async fn test_load_missing_model_fails_fast() {
        let engine = test_engine();
        let err = engine.load().await.unwrap_err();
        assert!(matches!(err, WispError::ModelNotFound(_)));
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn test_generate_before_load_rejected() {
        let engine = test_engine();
        let err = engine
            .generate(&[Message::user("hi")], &GenerationParameters::default())
            .unwrap_err();
        assert!(matches!(err, WispError::ModelNotLoaded));
    }

    #[tokio::test]
    async fn test_unload_before_load_is_noop() {
        let engine = test_engine();
        engine.unload().await.unwrap();
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn test_concurrent_generation_rejected() {
        let engine = test_engine();
        // Simulate a loaded engine with a generation in flight; the guard
        // fires before anything touches the worker.
        engine.loaded.store(true, Ordering::Release);
        engine.in_flight.store(true, Ordering::Release);

        let err = engine
            .generate(&[Message::user("hi")], &GenerationParameters::default())
            .unwrap_err();
        match err {
            WispError::GenerationFailed(msg) => assert!(msg.contains("already in progress")),
            other => panic!("expected GenerationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_small_context_size_floored() {
        let mut config = EngineConfig::new("/models/m.gguf");
        config.context_size = 128;
        assert_eq!(effective_context_size(&config), 512);
        config.context_size = 8192;
        assert_eq!(effective_context_size(&config), 8192);
    }

    #[test]
    fn test_worker_threads_at_least_one() {
        assert!(worker_threads() >= 1);
    }

    #[tokio::test]
    async fn test_status_idle_until_loaded() {
        let engine = test_engine();
        assert_eq!(engine.status().current(), EngineState::Idle);
        assert!(engine.model_info().is_none());

        let _ = engine.load().await;
        // Load fails (missing path) before any transition happens.
        assert_eq!(engine.status().current(), EngineState::Idle);
    }

    #[test]
    fn test_cancel_request_is_idempotent() {
        let engine = test_engine();
        engine.request_cancel();
        engine.request_cancel();
        assert!(engine.cancel.load(Ordering::Relaxed));
    }

    // --- StopScanner ---

    #[test]
    fn test_stop_scanner_passthrough_without_stops() {
        let mut stops = StopScanner::new(&[]);
        assert_eq!(stops.push("hello"), ("hello".into(), false));
    }

    #[test]
    fn test_stop_scanner_trims_matched_suffix() {
        let mut stops = StopScanner::new(&["<|end|>".to_string()]);
        let (emit, hit) = stops.push("answer<|end|>");
        assert_eq!(emit, "answer");
        assert!(hit);
    }

    #[test]
    fn test_stop_scanner_catches_stop_across_pieces() {
        let mut stops = StopScanner::new(&["STOP".to_string()]);
        let (emit, hit) = stops.push("text ST");
        assert_eq!(emit, "text ST");
        assert!(!hit);
        let (emit, hit) = stops.push("OP trailing");
        assert_eq!(emit, "");
        assert!(hit);
    }

    #[test]
    fn test_stop_scanner_ignores_non_matches() {
        let mut stops = StopScanner::new(&["STOP".to_string()]);
        let (emit, hit) = stops.push("nothing to see");
        assert_eq!(emit, "nothing to see");
        assert!(!hit);
    }

    #[test]
    fn test_stop_scanner_earliest_stop_wins() {
        let mut stops = StopScanner::new(&["BBB".to_string(), "A".to_string()]);
        let (emit, hit) = stops.push("xyAzzBBB");
        assert_eq!(emit, "xy");
        assert!(hit);
    }
}
