//! The agent coordinator: a bounded ReAct loop over the engine seam.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::catalog::canonical_json;
use super::config::AgentConfig;
use super::tools::{Tool, ToolOutput, ToolRegistry};
use super::AgentEvent;
use crate::conversation::{Message, Role, ToolResult};
use crate::engine::{FinishReason, GenerationParameters, GenerationSource, TokenEvent};
use crate::error::WispError;

/// How many agent events may queue before the driving task blocks.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Drives the engine through a bounded reason/act loop and mediates tool
/// dispatch.
///
/// One coordinator wraps one engine. `process()` snapshots the conversation
/// it is given; the caller owns persistence of the messages it later reads
/// off the event stream.
pub struct AgentCoordinator {
    engine: Arc<dyn GenerationSource>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
    processing: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCoordinator {
    pub fn new(
        engine: Arc<dyn GenerationSource>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            processing: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Whether a run is currently in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Runs the agent loop over the given conversation, streaming
    /// [`AgentEvent`]s. Must be called within a Tokio runtime.
    ///
    /// When the first message is not a system message, one is prepended from
    /// the configured identity, persona, and the registry's tool catalog.
    pub fn process(
        &self,
        messages: Vec<Message>,
        parameters: GenerationParameters,
    ) -> AgentStream {
        self.cancel.store(false, Ordering::Release);
        self.processing.store(true, Ordering::Release);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let processing = self.processing.clone();
        let parameters = parameters.clamped();

        let handle = tokio::spawn(async move {
            drive(engine, registry, config, messages, parameters, &tx, &cancel).await;
            processing.store(false, Ordering::Release);
        });
        *self.task.lock().expect("agent task slot poisoned") = Some(handle);

        AgentStream::new(rx, self.cancel.clone())
    }

    /// Cancels the in-flight run: aborts the driving task, sets the engine's
    /// cancel flag, and resets processing state. Idempotent.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().expect("agent task slot poisoned").take() {
            task.abort();
        }
        self.engine.request_cancel();
        self.processing.store(false, Ordering::Release);
    }
}

/// A lazy stream of [`AgentEvent`]s for one agent run.
///
/// Dropping the stream before completion requests cancellation of the run.
pub struct AgentStream {
    rx: mpsc::Receiver<Result<AgentEvent, WispError>>,
    cancel: Arc<AtomicBool>,
    finished: bool,
}

impl AgentStream {
    fn new(rx: mpsc::Receiver<Result<AgentEvent, WispError>>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            cancel,
            finished: false,
        }
    }
}

impl Stream for AgentStream {
    type Item = Result<AgentEvent, WispError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if matches!(item, Ok(AgentEvent::Completed) | Err(_)) {
                    this.finished = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.store(true, Ordering::Relaxed);
        }
    }
}

type EventSender = mpsc::Sender<Result<AgentEvent, WispError>>;

async fn send(tx: &EventSender, event: AgentEvent) -> bool {
    tx.send(Ok(event)).await.is_ok()
}

async fn drive(
    engine: Arc<dyn GenerationSource>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
    mut conversation: Vec<Message>,
    parameters: GenerationParameters,
    tx: &EventSender,
    cancel: &AtomicBool,
) {
    if conversation.first().map(|m| m.role) != Some(Role::System) {
        let system = build_system_prompt(&config, &registry);
        conversation.insert(0, Message::system(system));
    }

    for iteration in 1..=config.max_iterations.max(1) {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!("agent run cancelled before iteration {iteration}");
            return;
        }

        let mut stream = match engine.generate(&conversation, &parameters) {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let mut accumulated = String::new();
        let mut pending = Vec::new();
        let mut finish = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(TokenEvent::Token { text }) => {
                    accumulated.push_str(&text);
                    if !send(tx, AgentEvent::Text { text }).await {
                        engine.request_cancel();
                        return;
                    }
                }
                Ok(TokenEvent::ToolCall { call }) => {
                    if !send(
                        tx,
                        AgentEvent::ToolCallStarted {
                            name: call.name.clone(),
                        },
                    )
                    .await
                    {
                        engine.request_cancel();
                        return;
                    }
                    pending.push(call);
                }
                Ok(TokenEvent::Done { reason }) => {
                    finish = Some(reason);
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        drop(stream);

        if matches!(finish, Some(FinishReason::Cancelled)) || cancel.load(Ordering::Relaxed) {
            tracing::debug!("generation cancelled; agent run finishing cleanly");
            return;
        }

        // Termination rule: the engine's finish reason is informational only
        // (small models mislabel it); what decides is whether this iteration
        // produced tool calls.
        if pending.is_empty() {
            let _ = send(tx, AgentEvent::Completed).await;
            return;
        }

        tracing::debug!("iteration {iteration}: {} tool call(s)", pending.len());
        conversation
            .push(Message::assistant(accumulated.clone()).with_tool_calls(pending.clone()));

        for call in &pending {
            if !send(
                tx,
                AgentEvent::ToolExecuting {
                    name: call.name.clone(),
                },
            )
            .await
            {
                return;
            }

            let args = parse_arguments(&call.arguments);
            let output = match registry.execute_by_name(&call.name, args).await {
                Ok(output) => output,
                Err(e) => ToolOutput::error(format!("Tool '{}' failed: {}", call.name, e)),
            };
            tracing::debug!(
                "tool '{}' finished ({} bytes, error={})",
                call.name,
                output.content.len(),
                output.is_error
            );

            if !send(
                tx,
                AgentEvent::ToolResult {
                    name: call.name.clone(),
                    content: output.content.clone(),
                },
            )
            .await
            {
                return;
            }

            conversation.push(
                Message::tool(output.content.clone()).with_tool_result(ToolResult {
                    tool_call_id: call.id.clone(),
                    content: output.content,
                    is_error: output.is_error,
                }),
            );
        }

        if iteration == config.max_iterations.max(1) {
            tracing::warn!(
                "agent hit the iteration cap ({}) with tool calls still pending",
                config.max_iterations
            );
            let notice = format!(
                "Stopped after {} tool iterations without reaching a final answer.",
                config.max_iterations
            );
            if !send(tx, AgentEvent::Text { text: notice }).await {
                return;
            }
            let _ = send(tx, AgentEvent::Completed).await;
            return;
        }
    }
}

/// Parses a tool call's JSON-encoded argument string; anything that is not a
/// JSON object becomes empty arguments.
fn parse_arguments(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::debug!("tool arguments were not a JSON object; using {{}}");
            Map::new()
        }
    }
}

/// Assembles the system prompt: identity, persona suffix, tool catalog, and
/// the tool-call protocol paragraph.
fn build_system_prompt(config: &AgentConfig, registry: &ToolRegistry) -> String {
    let mut prompt = config.identity.clone();
    if !config.persona.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&config.persona);
    }

    let tools = registry.snapshot();
    if !tools.is_empty() {
        prompt.push_str("\n\n## Available Tools\n");
        for tool in &tools {
            prompt.push_str(&format!(
                "\n### {}\n{}\nParameters: {}\n",
                tool.name(),
                tool.description(),
                canonical_json(&tool.parameters_schema()),
            ));
        }
        prompt.push_str(
            "\nTo use a tool, emit exactly one tool call block:\n\
             <tool_call>{\"name\": \"tool_name\", \"arguments\": {\"param\": \"value\"}}</tool_call>\n\
             The payload must be valid JSON with the tool's name in \"name\" and an arguments \
             object in \"arguments\". After the tool result arrives, continue your answer using it.",
        );
    }

    prompt
}
