//! Conversation loop engine.
//!
//! The engine runs in a background task, communicating with its caller via
//! channels. This enables:
//! - Non-blocking callers during model calls
//! - Real-time streaming updates
//! - Proper cancellation support
//! - Tool execution orchestration
//!
//! One conversation is a loop of turns: stream a model response, extract
//! tool calls from it, execute them (dependency-aware, cached, deduped),
//! feed the results back, repeat until the model stops requesting tools or
//! a guard trips (turn limit, stuck detection, cancellation).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{CoreConfig, STUCK_TURN_THRESHOLD};
use crate::core::cache::fingerprint;
use crate::core::events::{AbortReason, ConversationStatus, Event};
use crate::core::extractor::{ExtractedToolCall, StreamOutcome, ToolCallExtractor};
use crate::core::history::{ConversationHistory, ConversationTurn};
use crate::core::ops::Op;
use crate::core::resolver::ToolInvocation;
use crate::core::scheduler::{ExecutionPolicy, FailurePolicy, Scheduler, ToolExecutionResult};
use crate::llm::ModelClient;
use crate::tools::ToolRegistry;

// === Stream guards ===

/// Hard cap on total content accumulated from a single model stream.
const STREAM_MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024; // 10 MB
/// Hard cap on wall-clock duration of a single model stream.
const STREAM_MAX_DURATION_SECS: u64 = 300;

/// Tool result content longer than this is compacted before it re-enters
/// the conversation.
const TOOL_RESULT_MAX_BYTES: usize = 12_000;
/// Verbatim head kept when a tool result is compacted.
const TOOL_RESULT_SNIPPET_CHARS: usize = 900;

// === Handle ===

/// Handle to communicate with the engine
#[derive(Clone)]
pub struct EngineHandle {
    /// Send operations to the engine
    pub tx_op: mpsc::Sender<Op>,
    /// Receive events from the engine
    pub rx_event: Arc<RwLock<mpsc::Receiver<Event>>>,
    /// Shared pointer to the cancellation token for the current request.
    cancel_token: Arc<StdMutex<CancellationToken>>,
}

impl EngineHandle {
    /// Send an operation to the engine
    pub async fn send(&self, op: Op) -> Result<()> {
        self.tx_op.send(op).await?;
        Ok(())
    }

    /// Receive the next event, or `None` once the engine has shut down.
    pub async fn next_event(&self) -> Option<Event> {
        self.rx_event.write().await.recv().await
    }

    /// Cancel the current request
    pub fn cancel(&self) {
        match self.cancel_token.lock() {
            Ok(token) => token.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    /// Check if a request is currently cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self.cancel_token.lock() {
            Ok(token) => token.is_cancelled(),
            Err(poisoned) => poisoned.into_inner().is_cancelled(),
        }
    }
}

// === Engine ===

/// The core engine that processes operations and emits events
pub struct Engine {
    config: CoreConfig,
    client: Arc<dyn ModelClient>,
    scheduler: Scheduler,
    history: ConversationHistory,
    rx_op: mpsc::Receiver<Op>,
    tx_event: mpsc::Sender<Event>,
    cancel_token: CancellationToken,
    shared_cancel_token: Arc<StdMutex<CancellationToken>>,
}

/// How one conversation ended, used to drive the terminal event.
enum LoopEnd {
    Completed,
    Aborted(AbortReason),
}

impl Engine {
    /// Create a new engine and its handle.
    pub fn new(
        config: CoreConfig,
        registry: ToolRegistry,
        client: Arc<dyn ModelClient>,
    ) -> (Self, EngineHandle) {
        let (tx_op, rx_op) = mpsc::channel(32);
        let (tx_event, rx_event) = mpsc::channel(256);

        let cancel_token = CancellationToken::new();
        let shared_cancel_token = Arc::new(StdMutex::new(cancel_token.clone()));

        let scheduler = Scheduler::new(registry, config.cache_max_entries, config.cache_ttl());
        let history = ConversationHistory::new(config.history_max_turns);

        let engine = Self {
            config,
            client,
            scheduler,
            history,
            rx_op,
            tx_event,
            cancel_token,
            shared_cancel_token: Arc::clone(&shared_cancel_token),
        };
        let handle = EngineHandle {
            tx_op,
            rx_event: Arc::new(RwLock::new(rx_event)),
            cancel_token: shared_cancel_token,
        };
        (engine, handle)
    }

    /// Process operations until the channel closes or `Op::Shutdown`.
    pub async fn run(mut self) {
        while let Some(op) = self.rx_op.recv().await {
            match op {
                Op::UserMessage { content } => {
                    self.reset_cancel_token();
                    self.run_conversation(content).await;
                }
                Op::ClearToolCache => {
                    self.scheduler.clear_cache();
                    let _ = self
                        .tx_event
                        .send(Event::status("Tool cache cleared"))
                        .await;
                }
                Op::Cancel => {
                    self.cancel_token.cancel();
                }
                Op::Shutdown => break,
            }
        }
    }

    fn reset_cancel_token(&mut self) {
        self.cancel_token = CancellationToken::new();
        match self.shared_cancel_token.lock() {
            Ok(mut token) => *token = self.cancel_token.clone(),
            Err(poisoned) => *poisoned.into_inner() = self.cancel_token.clone(),
        }
    }

    // === Conversation loop ===

    async fn run_conversation(&mut self, content: String) {
        self.history.push(ConversationTurn::user(content));

        let mut consecutive_failing_turns: u32 = 0;
        let mut turn_index: u32 = 0;

        let end = loop {
            if turn_index >= self.config.max_turns {
                break LoopEnd::Aborted(AbortReason::TurnLimitExceeded {
                    max_turns: self.config.max_turns,
                });
            }
            if self.cancel_token.is_cancelled() {
                break LoopEnd::Aborted(AbortReason::Cancelled);
            }

            let _ = self.tx_event.send(Event::TurnStarted { turn_index }).await;
            tracing::debug!(
                turn = turn_index,
                provider = self.client.provider_name(),
                "turn started"
            );

            let (calls, stream_failure) = match self.stream_turn(turn_index).await {
                Ok(streamed) => streamed,
                Err(reason) => break LoopEnd::Aborted(reason),
            };
            if self.cancel_token.is_cancelled() {
                break LoopEnd::Aborted(AbortReason::Cancelled);
            }
            if let Some(message) = stream_failure {
                break LoopEnd::Aborted(AbortReason::Stream { message });
            }

            if calls.is_empty() {
                let _ = self
                    .tx_event
                    .send(Event::TurnComplete {
                        turn_index,
                        tool_calls: 0,
                    })
                    .await;
                break LoopEnd::Completed;
            }

            let any_success = match self.dispatch_tool_calls(&calls).await {
                Ok(any_success) => any_success,
                Err(reason) => break LoopEnd::Aborted(reason),
            };
            if self.cancel_token.is_cancelled() {
                break LoopEnd::Aborted(AbortReason::Cancelled);
            }

            if any_success {
                consecutive_failing_turns = 0;
            } else {
                consecutive_failing_turns += 1;
                if consecutive_failing_turns >= STUCK_TURN_THRESHOLD {
                    break LoopEnd::Aborted(AbortReason::Stuck {
                        failing_turns: consecutive_failing_turns,
                    });
                }
            }

            let _ = self
                .tx_event
                .send(Event::TurnComplete {
                    turn_index,
                    tool_calls: calls.len(),
                })
                .await;
            turn_index += 1;
        };

        match end {
            LoopEnd::Completed => {
                let _ = self
                    .tx_event
                    .send(Event::ConversationEnded {
                        status: ConversationStatus::Completed,
                        reason: None,
                    })
                    .await;
            }
            LoopEnd::Aborted(reason) => {
                tracing::warn!(%reason, "conversation aborted");
                let _ = self
                    .tx_event
                    .send(Event::ConversationEnded {
                        status: ConversationStatus::Aborted,
                        reason: Some(reason),
                    })
                    .await;
            }
        }
    }

    /// Stream one model response, extract tool calls, and append the
    /// assistant turn. `Ok` carries the extracted calls plus a stream
    /// failure message when the stream died midway; `Err` means the turn
    /// could not start at all.
    async fn stream_turn(
        &mut self,
        turn_index: u32,
    ) -> Result<(Vec<ExtractedToolCall>, Option<String>), AbortReason> {
        let mut stream = self
            .client
            .stream_response(self.history.turns())
            .await
            .map_err(|e| AbortReason::Stream {
                message: e.to_string(),
            })?;

        let mut extractor = ToolCallExtractor::new(self.config.max_parse_attempts);
        let mut calls: Vec<ExtractedToolCall> = Vec::new();
        let mut stream_failure: Option<String> = None;

        let stream_start = Instant::now();
        let mut stream_content_bytes: usize = 0;
        let chunk_timeout = self.config.stream_chunk_timeout();
        let max_duration = Duration::from_secs(STREAM_MAX_DURATION_SECS);

        loop {
            let poll_outcome = tokio::select! {
                _ = self.cancel_token.cancelled() => None,
                result = tokio::time::timeout(chunk_timeout, stream.next()) => {
                    match result {
                        Ok(Some(chunk_result)) => Some(chunk_result),
                        Ok(None) => None, // stream ended normally
                        Err(_) => {
                            let msg = format!(
                                "Stream stalled: no data received for {}s, closing stream",
                                self.config.stream_chunk_timeout_secs,
                            );
                            tracing::warn!("{msg}");
                            stream_failure.get_or_insert(msg);
                            None
                        }
                    }
                }
            };
            let Some(chunk_result) = poll_outcome else {
                break;
            };

            if self.cancel_token.is_cancelled() {
                break;
            }

            // Guard: max wall-clock duration
            if stream_start.elapsed() > max_duration {
                let msg = format!(
                    "Stream exceeded maximum duration of {STREAM_MAX_DURATION_SECS}s, closing"
                );
                tracing::warn!("{msg}");
                stream_failure.get_or_insert(msg);
                break;
            }

            // Guard: max accumulated content bytes
            if stream_content_bytes > STREAM_MAX_CONTENT_BYTES {
                let msg = format!(
                    "Stream exceeded maximum content size of {STREAM_MAX_CONTENT_BYTES} bytes, closing"
                );
                tracing::warn!("{msg}");
                stream_failure.get_or_insert(msg);
                break;
            }

            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    stream_failure.get_or_insert(e.to_string());
                    break;
                }
            };
            stream_content_bytes += chunk.len();

            let _ = self
                .tx_event
                .send(Event::MessageDelta {
                    turn_index,
                    content: chunk.clone(),
                })
                .await;

            for call in extractor.push_chunk(&chunk) {
                let _ = self
                    .tx_event
                    .send(Event::ToolCallStarted {
                        id: call.id.clone().unwrap_or_else(|| call.identity.clone()),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .await;
                calls.push(call);
            }
        }

        match extractor.finish() {
            StreamOutcome::Clean => {}
            StreamOutcome::IncompleteObject { pending_bytes } => {
                tracing::debug!(pending_bytes, "stream ended mid-object, partial call dropped");
            }
            StreamOutcome::Aborted { parse_failures } => {
                let msg = format!(
                    "Tool call extraction gave up after {parse_failures} malformed payload(s)"
                );
                tracing::warn!("{msg}");
                let _ = self.tx_event.send(Event::error(msg, true)).await;
            }
        }

        self.history
            .push(ConversationTurn::assistant(extractor.raw_text().to_string()));

        Ok((calls, stream_failure))
    }

    /// Execute one turn's tool calls and append their results to history.
    /// Returns whether any call succeeded.
    async fn dispatch_tool_calls(
        &mut self,
        calls: &[ExtractedToolCall],
    ) -> Result<bool, AbortReason> {
        let invocations = self.build_invocations(calls);

        let policy = ExecutionPolicy {
            max_concurrency: self.config.max_concurrency,
            tool_timeout: self.config.tool_timeout(),
            failure: if self.config.retry.enabled {
                FailurePolicy::Retry
            } else {
                FailurePolicy::Continue
            },
            retry: self.config.retry.clone(),
        };

        let results = self
            .scheduler
            .execute(&invocations, &policy, &self.cancel_token)
            .await
            .map_err(AbortReason::Scheduling)?;

        let mut any_success = false;
        for inv in &invocations {
            let fp = fingerprint(&inv.name, &inv.params);
            let result = results
                .get(&fp)
                .cloned()
                .unwrap_or_else(|| ToolExecutionResult {
                    fingerprint: fp.clone(),
                    invocation_id: inv.id.clone(),
                    tool_name: inv.name.clone(),
                    success: false,
                    output: None,
                    error: Some("not executed".to_string()),
                    duration_ms: 0,
                    from_cache: false,
                });
            any_success |= result.success;

            let _ = self
                .tx_event
                .send(Event::ToolCallComplete {
                    id: inv.id.clone(),
                    name: inv.name.clone(),
                    success: result.success,
                    content: result.content().to_string(),
                    duration_ms: result.duration_ms,
                    from_cache: result.from_cache,
                })
                .await;

            let content = compact_tool_content(result.content());
            self.history.push(ConversationTurn::tool(
                content,
                json!({
                    "id": inv.id,
                    "tool": inv.name,
                    "success": result.success,
                    "from_cache": result.from_cache,
                    "duration_ms": result.duration_ms,
                }),
            ));
        }
        Ok(any_success)
    }

    /// Turn extracted calls into invocations, wiring registry-declared
    /// dependencies that point at tools also requested this turn.
    fn build_invocations(&self, calls: &[ExtractedToolCall]) -> Vec<ToolInvocation> {
        let requested: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        calls
            .iter()
            .map(|call| {
                let deps: Vec<&str> = self
                    .scheduler
                    .registry()
                    .get(&call.name)
                    .map(|tool| {
                        tool.declared_dependencies()
                            .iter()
                            .copied()
                            .filter(|dep| *dep != call.name && requested.contains(dep))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut inv = ToolInvocation::new(&call.name, call.arguments.clone())
                    .with_dependencies(deps);
                if let Some(id) = &call.id {
                    inv = inv.with_id(id);
                }
                inv
            })
            .collect()
    }
}

/// Spawn an engine on the current runtime and return its handle.
pub fn spawn_engine(
    config: CoreConfig,
    registry: ToolRegistry,
    client: Arc<dyn ModelClient>,
) -> EngineHandle {
    let (engine, handle) = Engine::new(config, registry, client);
    tokio::spawn(engine.run());
    handle
}

/// Compact oversized tool output: keep a verbatim head and note the cut.
fn compact_tool_content(content: &str) -> String {
    if content.len() <= TOOL_RESULT_MAX_BYTES {
        return content.to_string();
    }
    let head: String = content.chars().take(TOOL_RESULT_SNIPPET_CHARS).collect();
    let dropped = content.len() - head.len();
    format!("{head}\n... [{dropped} bytes truncated]")
}
