// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Agent transport — the per-session owner of one live LLM conversation
//! plus the MCP tool subprocess.
//!
//! # Design
//!
//! ```text
//! Session ── submit(prompt) ──► DirectTransport
//!                                   │ spawns turn task
//!                                   ▼
//!                      ┌─ LlmClient.stream_completion ─┐
//!                      │        (SSE stream)           │
//!                      │  tool_use? ──► McpClient ─────┤
//!                      │               (stdio child)   │
//!                      └──────── loop until end ───────┘
//!                                   │
//! Session ◄── events() receiver ◄───┘  (finite: one terminal event)
//! ```
//!
//! The turn task runs the model ↔ tool loop until the model stops asking
//! for tools, the budget expires, the session cancels, or the child dies.
//! Exactly one of [`TransportEvent::TurnComplete`] /
//! [`TransportEvent::TurnError`] terminates every turn stream.
//!
//! # Failure latching
//!
//! An unexpected child exit fails the turn with `tool_backend_unavailable`
//! and latches the transport into a failed state: `submit` is refused from
//! then on and only `close` is legal.  Recovery is the session's job — a
//! model change (to the same id, if desired) constructs a fresh transport
//! with a fresh child.  The transport never restarts the child itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use inventa_config::Config;
use inventa_model::ModelEntry;

use crate::{
    error::TransportError,
    events::{TransportEvent, TurnErrorKind},
    llm::{LlmClient, LlmEvent, ToolSpec},
    mcp::McpClient,
    prompts::system_prompt,
};

/// Capacity of the per-turn event channel.
const EVENT_CAPACITY: usize = 256;

/// How long `reset`/`close` wait for a cancelled turn task to wind down.
const TURN_WIND_DOWN: Duration = Duration::from_secs(5);

/// One live conversation with the agent.
///
/// The capability set is deliberately small; everything stateful about a
/// conversation (history, tool connection, in-flight turn) lives behind it
/// so the session can treat transports as replaceable units.
#[async_trait]
pub trait AgentTransport: Send {
    /// Idempotently start the MCP subprocess and prepare the LLM session.
    /// On error no partial state remains.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Deliver a prompt.  Non-blocking: validates that the transport is
    /// open, not failed, and has no turn in flight, then spawns the turn.
    fn submit(&mut self, prompt: &str) -> Result<(), TransportError>;

    /// Take the event stream for the current turn.  Returns `None` when no
    /// turn is in flight or the stream was already taken.
    fn events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Request cooperative cancellation of the current turn.  The event
    /// stream terminates with `TurnError(cancelled)` shortly after.
    fn cancel(&self);

    /// Cancel any in-flight turn and clear the accumulated conversation
    /// context.  The MCP child keeps running.
    async fn reset(&mut self);

    /// Tear down the LLM session and the MCP subprocess, reaping both.
    /// Safe to call in any state; never blocks indefinitely.
    async fn close(&mut self);
}

/// Constructs transports for a session.  The gateway holds one factory for
/// its lifetime; tests substitute a scripted one.
pub trait TransportFactory: Send + Sync {
    fn build(&self, entry: &'static ModelEntry) -> Box<dyn AgentTransport>;
}

/// Factory for [`DirectTransport`]s bound to the process configuration.
pub struct DirectTransportFactory {
    config: Arc<Config>,
}

impl DirectTransportFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl TransportFactory for DirectTransportFactory {
    fn build(&self, entry: &'static ModelEntry) -> Box<dyn AgentTransport> {
        Box::new(DirectTransport::new(self.config.clone(), entry))
    }
}

struct ActiveTurn {
    cancel: CancellationToken,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    handle: JoinHandle<()>,
}

/// Transport that talks to the vendor API directly and owns the MCP child.
pub struct DirectTransport {
    config: Arc<Config>,
    llm: LlmClient,
    system: String,
    mcp: Option<Arc<McpClient>>,
    tools: Vec<ToolSpec>,
    /// Conversation history in vendor wire format.  Shared with the turn
    /// task; locked only for short, await-free sections.
    history: Arc<Mutex<Vec<Value>>>,
    turn: Option<ActiveTurn>,
    failed: Arc<AtomicBool>,
}

impl DirectTransport {
    pub fn new(config: Arc<Config>, entry: &'static ModelEntry) -> Self {
        let llm = LlmClient::new(
            entry.vendor_handle,
            config.llm.api_key.clone().unwrap_or_default(),
            config.llm.base_url.clone(),
        );
        Self {
            config,
            llm,
            system: system_prompt(),
            mcp: None,
            tools: Vec::new(),
            history: Arc::new(Mutex::new(Vec::new())),
            turn: None,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn turn_in_flight(&self) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    async fn wind_down_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            if tokio::time::timeout(TURN_WIND_DOWN, turn.handle)
                .await
                .is_err()
            {
                warn!("turn task did not wind down within the grace window");
            }
        }
    }
}

#[async_trait]
impl AgentTransport for DirectTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(TransportError::Failed);
        }
        if self.mcp.is_some() {
            return Ok(());
        }

        let mcp = McpClient::spawn(&self.config.tool_server)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let handshake = async {
            mcp.initialize().await?;
            mcp.list_tools().await
        }
        .await;

        match handshake {
            Ok(tools) => {
                debug!(model = self.llm.model(), tools = tools.len(), "transport open");
                self.tools = tools;
                self.mcp = Some(Arc::new(mcp));
                Ok(())
            }
            Err(e) => {
                // No partial state: reap the child before reporting.
                mcp.shutdown().await;
                Err(TransportError::Backend(e.to_string()))
            }
        }
    }

    fn submit(&mut self, prompt: &str) -> Result<(), TransportError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(TransportError::Failed);
        }
        let Some(mcp) = self.mcp.clone() else {
            return Err(TransportError::NotOpen);
        };
        if self.turn_in_flight() {
            return Err(TransportError::TurnInFlight);
        }

        self.history
            .lock()
            .expect("history lock")
            .push(json!({"role": "user", "content": prompt}));

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_turn(TurnContext {
            llm: self.llm.clone(),
            system: self.system.clone(),
            history: self.history.clone(),
            mcp,
            tools: self.tools.clone(),
            tool_prefix: self.config.tool_server.tool_prefix.clone(),
            budget: self.config.turn_budget(),
            cancel: cancel.clone(),
            failed: self.failed.clone(),
            tx,
        }));

        self.turn = Some(ActiveTurn {
            cancel,
            events_rx: Some(rx),
            handle,
        });
        Ok(())
    }

    fn events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.turn.as_mut().and_then(|t| t.events_rx.take())
    }

    fn cancel(&self) {
        if let Some(turn) = &self.turn {
            turn.cancel.cancel();
        }
    }

    async fn reset(&mut self) {
        self.wind_down_turn().await;
        self.history.lock().expect("history lock").clear();
    }

    async fn close(&mut self) {
        self.wind_down_turn().await;
        if let Some(mcp) = self.mcp.take() {
            mcp.shutdown().await;
        }
        self.tools.clear();
    }
}

// ─── Turn execution ───────────────────────────────────────────────────────────

struct TurnContext {
    llm: LlmClient,
    system: String,
    history: Arc<Mutex<Vec<Value>>>,
    mcp: Arc<McpClient>,
    tools: Vec<ToolSpec>,
    tool_prefix: String,
    budget: Duration,
    cancel: CancellationToken,
    failed: Arc<AtomicBool>,
    tx: mpsc::Sender<TransportEvent>,
}

/// Drive one turn to its single terminal event.
async fn run_turn(ctx: TurnContext) {
    let mut exit = ctx.mcp.exit_signal();
    let budget = ctx.budget;

    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            Err((TurnErrorKind::Cancelled, "turn cancelled".to_string()))
        }
        // wait_for errs only when the supervisor is gone, which also means
        // the child is gone.
        _ = exit.wait_for(|exited| *exited) => {
            Err((
                TurnErrorKind::ToolBackendUnavailable,
                "tool server exited during turn".to_string(),
            ))
        }
        res = tokio::time::timeout(
            budget,
            turn_loop(&ctx.llm, &ctx.system, &ctx.history, &ctx.mcp, &ctx.tools, &ctx.tool_prefix, &ctx.tx),
        ) => match res {
            Err(_) => Err((
                TurnErrorKind::Timeout,
                format!("turn exceeded {}s budget", budget.as_secs()),
            )),
            Ok(inner) => inner,
        }
    };

    match outcome {
        Ok(()) => {
            let _ = ctx.tx.send(TransportEvent::TurnComplete).await;
        }
        Err((kind, detail)) => {
            if kind == TurnErrorKind::ToolBackendUnavailable {
                ctx.failed.store(true, Ordering::SeqCst);
            }
            warn!(kind = kind.as_str(), %detail, "turn failed");
            let _ = ctx
                .tx
                .send(TransportEvent::TurnError { kind, detail })
                .await;
        }
    }
    // Dropping `tx` ends the finite event stream.
}

/// The model ↔ tool loop.  Returns when the model finishes a response
/// without requesting tools.
async fn turn_loop(
    llm: &LlmClient,
    system: &str,
    history: &Arc<Mutex<Vec<Value>>>,
    mcp: &Arc<McpClient>,
    tools: &[ToolSpec],
    tool_prefix: &str,
    tx: &mpsc::Sender<TransportEvent>,
) -> Result<(), (TurnErrorKind, String)> {
    loop {
        let messages = history.lock().expect("history lock").clone();
        let mut stream = llm
            .stream_completion(system, &messages, tools)
            .await
            .map_err(|e| (TurnErrorKind::Internal, e.to_string()))?;

        let mut text = String::new();
        let mut calls: Vec<PendingToolCall> = Vec::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(LlmEvent::TextDelta(t)) => {
                    if !t.is_empty() {
                        text.push_str(&t);
                        let _ = tx.send(TransportEvent::AssistantText(t)).await;
                    }
                }
                Ok(LlmEvent::ThinkingDelta(t)) => {
                    let _ = tx.send(TransportEvent::Thinking(t)).await;
                }
                Ok(LlmEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                }) => accumulate_tool_call(&mut calls, index, id, name, arguments),
                Ok(LlmEvent::Done) => break,
                Err(e) => return Err((TurnErrorKind::Internal, e.to_string())),
            }
        }

        let content = assistant_content(&text, &calls);
        if !content.is_empty() {
            history
                .lock()
                .expect("history lock")
                .push(json!({"role": "assistant", "content": content}));
        }

        if calls.is_empty() {
            return Ok(());
        }

        let mut results: Vec<Value> = Vec::with_capacity(calls.len());
        for call in calls {
            if !tool_allowed(&call.name, tool_prefix) {
                return Err((
                    TurnErrorKind::ToolNotAllowed,
                    format!("tool `{}` is outside the allow-list", call.name),
                ));
            }
            let _ = tx.send(TransportEvent::ToolUse(call.name.clone())).await;

            let args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
            match mcp.call_tool(&call.name, args).await {
                Ok(outcome) => {
                    let _ = tx
                        .send(TransportEvent::ToolResult(outcome.text.clone()))
                        .await;
                    results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": call.id,
                        "content": outcome.text,
                        "is_error": outcome.is_error,
                    }));
                }
                Err(e) => {
                    let kind = if mcp.has_exited() {
                        TurnErrorKind::ToolBackendUnavailable
                    } else {
                        TurnErrorKind::Internal
                    };
                    return Err((kind, e.to_string()));
                }
            }
        }
        history
            .lock()
            .expect("history lock")
            .push(json!({"role": "user", "content": results}));
    }
}

/// A tool invocation being assembled from streamed fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingToolCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

/// Fold one streamed `ToolCall` event into the per-turn accumulator.
/// The first event for an index establishes id and name; later events
/// append argument JSON fragments.
fn accumulate_tool_call(
    calls: &mut Vec<PendingToolCall>,
    index: u32,
    id: String,
    name: String,
    arguments: String,
) {
    if let Some(call) = calls.iter_mut().find(|c| c.index == index) {
        if !id.is_empty() {
            call.id = id;
        }
        if !name.is_empty() {
            call.name = name;
        }
        call.arguments.push_str(&arguments);
    } else {
        calls.push(PendingToolCall {
            index,
            id,
            name,
            arguments,
        });
    }
}

/// Build the assistant message content blocks committed to history.
fn assistant_content(text: &str, calls: &[PendingToolCall]) -> Vec<Value> {
    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for call in calls {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input,
        }));
    }
    content
}

fn tool_allowed(name: &str, prefix: &str) -> bool {
    prefix.is_empty() || name.starts_with(prefix)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
