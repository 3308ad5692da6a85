// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-connection session state machine.
//!
//! One `Session` mediates between one WebSocket client and one transport
//! at a time.  The socket handler drives it with inbound frames and with
//! transport events; the session answers by queueing chunks on the bounded
//! outbound channel whose other end is owned by the writer task.
//!
//! # States
//!
//! ```text
//!               ┌── prompt ──► AwaitingTurn ──(terminal chunk)──┐
//!               │                                               ▼
//!    Idle ─────┼── reset  ──► Resetting ──(reset_complete)──► Idle
//!               │                                               ▲
//!               └── model_change ─► SwitchingModel ─(model_changed)┘
//! ```
//!
//! Frames are dispatched serially (the socket loop awaits each handler),
//! so every transition is atomic with respect to frame dispatch.  A prompt
//! in any state but `Idle` is answered with `error(busy)` and dropped,
//! which guarantees at most one outstanding turn per session.
//!
//! # Late events
//!
//! Every turn gets a fresh sequence number.  Reset and model change bump
//! the number after cancelling the in-flight turn, so chunks from a
//! cancelled turn that are still queued behind the bump are recognized as
//! stale and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use inventa_agent::{TransportError, TransportEvent, TransportFactory, TurnErrorKind};
use inventa_config::Config;
use inventa_model::{default_entry, lookup, probe_available, ModelEntry};

use crate::{
    protocol::{
        parse_client_frame, ChatMessage, ClientFrame, ErrorKind, StreamChunk,
    },
    sanitize::Sanitizer,
};

/// How long a cancelled turn gets to acknowledge before the session moves
/// on regardless.  Generous; the transport promises prompt termination.
const CANCEL_ACK_WINDOW: Duration = Duration::from_secs(5);

/// Banner text in the `connected` frame.
const BANNER: &str = "Connected to inventa. Ask about devices, racks, sites, prefixes and cabling.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingTurn,
    SwitchingModel,
    Resetting,
    Closing,
}

/// Returned when the connection must end (writer gone or client evicted).
/// The socket loop breaks on it; everything else continues the session.
#[derive(Debug)]
pub struct SessionEnd;

pub struct Session {
    id: Uuid,
    config: Arc<Config>,
    factory: Arc<dyn TransportFactory>,
    sanitizer: Sanitizer,
    model: &'static ModelEntry,
    transport: Box<dyn inventa_agent::AgentTransport>,
    /// Latched when the tool backend dies; cleared by a successful switch.
    transport_failed: bool,
    phase: Phase,
    /// Monotonic turn number; stale transport events are dropped against it.
    turn_seq: u64,
    /// Messages this session synthesized (partial turns archived on switch).
    archived: Vec<ChatMessage>,
    /// Assistant text accumulated for the in-flight turn.
    partial: String,
    out_tx: mpsc::Sender<StreamChunk>,
    evt_tx: mpsc::Sender<(u64, TransportEvent)>,
    /// Resolved when the current turn's event stream has fully drained.
    turn_done: Option<oneshot::Receiver<()>>,
    last_activity: Instant,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        factory: Arc<dyn TransportFactory>,
        out_tx: mpsc::Sender<StreamChunk>,
        evt_tx: mpsc::Sender<(u64, TransportEvent)>,
    ) -> Self {
        let sanitizer = Sanitizer::from_config(&config);
        let model = default_entry(&config);
        let transport = factory.build(model);
        Self {
            id: Uuid::new_v4(),
            config,
            factory,
            sanitizer,
            model,
            transport,
            transport_failed: false,
            phase: Phase::Idle,
            turn_seq: 0,
            archived: Vec::new(),
            partial: String::new(),
            out_tx,
            evt_tx,
            turn_done: None,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model_id(&self) -> &'static str {
        self.model.id
    }

    /// Messages this session synthesized (partial turns archived on model
    /// switches), in order.
    pub fn archived(&self) -> &[ChatMessage] {
        &self.archived
    }

    /// When the client last sent a frame.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Send the mandatory `connected` frame, then open the transport.
    ///
    /// An open failure does not end the session: the client is told the
    /// tool backend is unavailable and can recover with a model change.
    pub async fn start(&mut self) -> Result<(), SessionEnd> {
        self.send(StreamChunk::connected(BANNER, self.model)).await?;
        if let Err(e) = self.transport.open().await {
            warn!(session = %self.id, "transport open failed: {e}");
            self.transport_failed = true;
            let detail = self.sanitizer.scrub(&e.to_string());
            self.send(StreamChunk::error(ErrorKind::ToolBackendUnavailable, &detail, true))
                .await?;
        }
        Ok(())
    }

    /// Dispatch one inbound text frame.
    pub async fn handle_frame(&mut self, text: &str) -> Result<(), SessionEnd> {
        self.last_activity = Instant::now();
        match parse_client_frame(text) {
            Err(e) => {
                debug!(session = %self.id, "bad frame: {e}");
                self.send(StreamChunk::error(ErrorKind::BadFrame, &e.to_string(), true))
                    .await
            }
            Ok(ClientFrame::Prompt { message }) => self.handle_prompt(&message).await,
            Ok(ClientFrame::Reset) => self.handle_reset().await,
            Ok(ClientFrame::ModelChange { model }) => self.handle_model_change(&model).await,
        }
    }

    /// Binary frames are not part of the protocol.
    pub async fn reject_binary(&mut self) -> Result<(), SessionEnd> {
        self.send(StreamChunk::error(
            ErrorKind::BadFrame,
            "binary frames are not supported",
            true,
        ))
        .await
    }

    /// Process one transport event tagged with its turn number.
    pub async fn handle_transport_event(
        &mut self,
        seq: u64,
        event: TransportEvent,
    ) -> Result<(), SessionEnd> {
        if seq != self.turn_seq {
            debug!(session = %self.id, seq, current = self.turn_seq, "dropping stale turn event");
            return Ok(());
        }
        match event {
            TransportEvent::AssistantText(text) => {
                self.partial.push_str(&text);
                self.send(StreamChunk::text_delta(text)).await
            }
            TransportEvent::Thinking(text) => self.send(StreamChunk::thinking(text)).await,
            TransportEvent::ToolUse(name) => self.send(StreamChunk::tool_use(name)).await,
            TransportEvent::ToolResult(payload) => {
                self.send(StreamChunk::tool_result(payload)).await
            }
            TransportEvent::TurnComplete => {
                self.finish_turn();
                self.send(StreamChunk::text_terminal()).await
            }
            TransportEvent::TurnError { kind, detail } => {
                self.finish_turn();
                if kind == TurnErrorKind::ToolBackendUnavailable {
                    self.transport_failed = true;
                }
                let detail = self.sanitizer.scrub(&detail);
                self.send(StreamChunk::error(kind.into(), &detail, true)).await
            }
        }
    }

    /// Tear down the transport.  Called when the socket closes.
    pub async fn close(&mut self) {
        self.phase = Phase::Closing;
        self.transport.close().await;
    }

    // ── Frame handlers ────────────────────────────────────────────────────

    async fn handle_prompt(&mut self, message: &str) -> Result<(), SessionEnd> {
        if self.phase != Phase::Idle {
            return self
                .send(StreamChunk::error(
                    ErrorKind::Busy,
                    "a turn is already in flight",
                    true,
                ))
                .await;
        }
        if self.transport_failed {
            return self
                .send(StreamChunk::error(
                    ErrorKind::ToolBackendUnavailable,
                    "tool backend unavailable; switch models to recover",
                    true,
                ))
                .await;
        }

        self.turn_seq += 1;
        self.partial.clear();

        match self.transport.submit(message) {
            Ok(()) => {}
            Err(TransportError::TurnInFlight) => {
                return self
                    .send(StreamChunk::error(
                        ErrorKind::Busy,
                        "a turn is already in flight",
                        true,
                    ))
                    .await;
            }
            Err(e @ (TransportError::Failed | TransportError::NotOpen | TransportError::Backend(_))) => {
                self.transport_failed = true;
                let detail = self.sanitizer.scrub(&e.to_string());
                return self
                    .send(StreamChunk::error(
                        ErrorKind::ToolBackendUnavailable,
                        &detail,
                        true,
                    ))
                    .await;
            }
        }

        let Some(events) = self.transport.events() else {
            // Contract violation in the transport; fail the turn locally.
            warn!(session = %self.id, "transport accepted submit but yielded no event stream");
            return self
                .send(StreamChunk::error(
                    ErrorKind::Internal,
                    "transport produced no event stream",
                    true,
                ))
                .await;
        };

        let (done_tx, done_rx) = oneshot::channel();
        spawn_pump(self.turn_seq, events, self.evt_tx.clone(), done_tx);
        self.turn_done = Some(done_rx);
        self.phase = Phase::AwaitingTurn;
        info!(session = %self.id, turn = self.turn_seq, "turn started");
        Ok(())
    }

    async fn handle_reset(&mut self) -> Result<(), SessionEnd> {
        self.phase = Phase::Resetting;
        self.cancel_inflight_turn().await;
        self.partial.clear();
        self.transport.reset().await;
        self.phase = Phase::Idle;
        info!(session = %self.id, "session reset");
        self.send(StreamChunk::reset_complete()).await
    }

    async fn handle_model_change(&mut self, id: &str) -> Result<(), SessionEnd> {
        let Some(entry) = lookup(id) else {
            return self
                .send(StreamChunk::error(
                    ErrorKind::UnknownModel,
                    &format!("unknown model id `{id}`"),
                    true,
                ))
                .await;
        };
        if !probe_available(entry, &self.config).await {
            return self
                .send(StreamChunk::error(
                    ErrorKind::ModelUnavailable,
                    &format!("model `{id}` is not available"),
                    true,
                ))
                .await;
        }

        self.phase = Phase::SwitchingModel;
        self.cancel_inflight_turn().await;

        // Archive whatever the cancelled turn had streamed so far.  The
        // client gets it back in the model_changed metadata.
        let mut archived_now = Vec::new();
        if !self.partial.is_empty() {
            let msg = ChatMessage::assistant(std::mem::take(&mut self.partial));
            self.archived.push(msg.clone());
            archived_now.push(msg);
        }

        let previous = self.model.id;
        self.transport.close().await;

        let mut target = entry;
        let mut transport = self.factory.build(target);
        if let Err(e) = transport.open().await {
            warn!(session = %self.id, model = target.id, "transport open failed on switch: {e}");
            // Fall back to the configured default before giving up.
            let fallback = default_entry(&self.config);
            let mut recovered = false;
            if fallback.id != target.id {
                let mut fb = self.factory.build(fallback);
                match fb.open().await {
                    Ok(()) => {
                        target = fallback;
                        transport = fb;
                        recovered = true;
                    }
                    Err(e2) => {
                        warn!(session = %self.id, model = fallback.id, "fallback open failed: {e2}");
                    }
                }
            }
            if !recovered {
                // Keep the dead transport; prompts will answer with
                // tool_backend_unavailable until a later switch succeeds.
                self.transport = transport;
                self.transport_failed = true;
                self.phase = Phase::Idle;
                let detail = self.sanitizer.scrub(&e.to_string());
                return self
                    .send(StreamChunk::error(
                        ErrorKind::ToolBackendUnavailable,
                        &detail,
                        true,
                    ))
                    .await;
            }
        }

        self.transport = transport;
        self.transport_failed = false;
        self.model = target;
        self.phase = Phase::Idle;
        info!(session = %self.id, from = previous, to = target.id, "model changed");
        self.send(StreamChunk::model_changed(target, previous, &archived_now))
            .await
    }

    // ── Internals ─────────────────────────────────────────────────────────

    /// Cancel the in-flight turn (if any), wait for its stream to drain,
    /// and bump the turn number so stragglers are dropped.
    async fn cancel_inflight_turn(&mut self) {
        if let Some(done) = self.turn_done.take() {
            self.transport.cancel();
            if tokio::time::timeout(CANCEL_ACK_WINDOW, done).await.is_err() {
                warn!(session = %self.id, "cancelled turn did not acknowledge in time");
            }
        }
        self.turn_seq += 1;
    }

    fn finish_turn(&mut self) {
        self.phase = Phase::Idle;
        self.partial.clear();
        self.turn_done = None;
    }

    /// Queue one chunk, bounded by the stall window.
    ///
    /// A full queue means the client stopped reading; after the window we
    /// make a best-effort attempt to tell it why and end the session.
    async fn send(&mut self, chunk: StreamChunk) -> Result<(), SessionEnd> {
        match tokio::time::timeout(self.config.stall_window(), self.out_tx.send(chunk)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionEnd),
            Err(_) => {
                warn!(session = %self.id, "outbound queue stalled, evicting slow consumer");
                let _ = self.out_tx.try_send(StreamChunk::error(
                    ErrorKind::SlowConsumer,
                    "client is not reading fast enough",
                    true,
                ));
                Err(SessionEnd)
            }
        }
    }
}

/// Forward one turn's events to the session, tagged with the turn number,
/// and signal completion once the stream ends.
fn spawn_pump(
    seq: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    evt_tx: mpsc::Sender<(u64, TransportEvent)>,
    done_tx: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if evt_tx.send((seq, event)).await.is_err() {
                break;
            }
        }
        let _ = done_tx.send(());
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkType;
    use inventa_agent::{ScriptedPlan, ScriptedTransportFactory};
    use std::sync::atomic::Ordering;

    const RECV_TIMEOUT: Duration = Duration::from_millis(500);

    struct Harness {
        session: Session,
        out_rx: mpsc::Receiver<StreamChunk>,
        evt_rx: mpsc::Receiver<(u64, TransportEvent)>,
        factory: Arc<ScriptedTransportFactory>,
    }

    fn harness(plans: Vec<ScriptedPlan>) -> Harness {
        harness_with(Config::default(), plans)
    }

    fn harness_with(config: Config, plans: Vec<ScriptedPlan>) -> Harness {
        let factory = Arc::new(ScriptedTransportFactory::new(plans));
        let (out_tx, out_rx) = mpsc::channel(64);
        let (evt_tx, evt_rx) = mpsc::channel(64);
        let session = Session::new(Arc::new(config), factory.clone(), out_tx, evt_tx);
        Harness {
            session,
            out_rx,
            evt_rx,
            factory,
        }
    }

    async fn next_chunk(h: &mut Harness) -> StreamChunk {
        tokio::time::timeout(RECV_TIMEOUT, h.out_rx.recv())
            .await
            .expect("no chunk within timeout")
            .expect("outbound channel closed")
    }

    /// Feed transport events into the session until it has emitted a
    /// terminal chunk, collecting everything emitted along the way.
    async fn run_turn_to_terminal(h: &mut Harness) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        loop {
            tokio::select! {
                ev = h.evt_rx.recv() => {
                    let (seq, ev) = ev.expect("event channel closed");
                    h.session.handle_transport_event(seq, ev).await.unwrap();
                }
                chunk = h.out_rx.recv() => {
                    let chunk = chunk.expect("outbound channel closed");
                    let terminal = chunk.is_terminal();
                    chunks.push(chunk);
                    if terminal {
                        return chunks;
                    }
                }
            }
        }
    }

    // ── Connection start ───────────────────────────────────────────────────

    #[tokio::test]
    async fn first_frame_is_connected_with_model_metadata() {
        let mut h = harness(vec![ScriptedPlan::default()]);
        h.session.start().await.unwrap();
        let chunk = next_chunk(&mut h).await;
        assert_eq!(chunk.kind, ChunkType::Connected);
        let meta = chunk.metadata.unwrap();
        assert_eq!(meta["model"]["id"], "auto");
        assert_eq!(meta["model"]["isAuto"], true);
    }

    #[tokio::test]
    async fn failed_open_reports_backend_error_but_session_survives() {
        let mut h = harness(vec![
            ScriptedPlan {
                open_error: Some("spawn failed".into()),
                ..Default::default()
            },
            ScriptedPlan::single_text_turn("recovered"),
        ]);
        h.session.start().await.unwrap();
        assert_eq!(next_chunk(&mut h).await.kind, ChunkType::Connected);

        let err = next_chunk(&mut h).await;
        assert_eq!(err.kind, ChunkType::Error);
        assert_eq!(err.content, "tool_backend_unavailable");
        assert!(err.completed);

        // A prompt is refused while the backend is down…
        h.session.handle_frame(r#"{"message":"hello"}"#).await.unwrap();
        assert_eq!(next_chunk(&mut h).await.content, "tool_backend_unavailable");

        // …and a model change to a fresh transport recovers.
        h.session
            .handle_frame(r#"{"type":"model_change","model":"auto"}"#)
            .await
            .unwrap();
        assert_eq!(next_chunk(&mut h).await.kind, ChunkType::ModelChanged);

        h.session.handle_frame(r#"{"message":"hello"}"#).await.unwrap();
        let chunks = run_turn_to_terminal(&mut h).await;
        assert!(chunks.iter().any(|c| c.content == "recovered"));
    }

    // ── Happy turn ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_turn_emits_exactly_one_terminal_text() {
        let mut h = harness(vec![ScriptedPlan::single_text_turn("Hi")]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await; // connected

        h.session.handle_frame(r#"{"message":"hello"}"#).await.unwrap();
        assert_eq!(h.session.phase(), Phase::AwaitingTurn);

        let chunks = run_turn_to_terminal(&mut h).await;
        assert_eq!(chunks[0].kind, ChunkType::Text);
        assert_eq!(chunks[0].content, "Hi");
        assert!(!chunks[0].completed);
        let last = chunks.last().unwrap();
        assert_eq!(last.kind, ChunkType::Text);
        assert!(last.completed);
        assert_eq!(chunks.iter().filter(|c| c.completed).count(), 1);
        assert_eq!(h.session.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn tool_chunks_are_forwarded_in_order() {
        let mut h = harness(vec![ScriptedPlan {
            scripts: vec![vec![
                TransportEvent::ToolUse("netbox_get_devices".into()),
                TransportEvent::ToolResult("3 devices".into()),
                TransportEvent::AssistantText("You have 3 devices.".into()),
                TransportEvent::TurnComplete,
            ]],
            ..Default::default()
        }]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"message":"count devices"}"#).await.unwrap();
        let chunks = run_turn_to_terminal(&mut h).await;
        let kinds: Vec<ChunkType> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChunkType::ToolUse,
                ChunkType::ToolResult,
                ChunkType::Text,
                ChunkType::Text,
            ]
        );
    }

    // ── Busy rejection ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_prompt_is_rejected_busy_while_turn_in_flight() {
        let mut h = harness(vec![ScriptedPlan::hanging_turns(vec![
            TransportEvent::AssistantText("working".into()),
        ])]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"message":"first"}"#).await.unwrap();
        h.session.handle_frame(r#"{"message":"second"}"#).await.unwrap();

        let busy = next_chunk(&mut h).await;
        assert_eq!(busy.kind, ChunkType::Error);
        assert_eq!(busy.content, "busy");
        assert!(busy.completed);
        assert_eq!(h.session.phase(), Phase::AwaitingTurn);
        h.session.close().await;
    }

    // ── Bad frames ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn malformed_frames_error_but_do_not_disconnect() {
        let mut h = harness(vec![ScriptedPlan::default()]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        for frame in ["{not json", r#"{"message":""}"#, r#"{"type":"subscribe"}"#, r#"{"foo":1}"#] {
            h.session.handle_frame(frame).await.unwrap();
            let err = next_chunk(&mut h).await;
            assert_eq!(err.content, "bad_frame", "frame: {frame}");
            assert!(err.completed);
        }
        assert_eq!(h.session.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn binary_frames_are_rejected() {
        let mut h = harness(vec![ScriptedPlan::default()]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;
        h.session.reject_binary().await.unwrap();
        assert_eq!(next_chunk(&mut h).await.content, "bad_frame");
    }

    // ── Reset ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reset_on_idle_session_emits_reset_complete_immediately() {
        let mut h = harness(vec![ScriptedPlan::default()]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"type":"reset"}"#).await.unwrap();
        let chunk = next_chunk(&mut h).await;
        assert_eq!(chunk.kind, ChunkType::ResetComplete);
        assert_eq!(chunk.content, "ok");
        assert_eq!(h.session.phase(), Phase::Idle);
        assert_eq!(h.factory.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mid_turn_reset_drops_late_chunks_from_cancelled_turn() {
        let mut h = harness(vec![ScriptedPlan {
            scripts: vec![
                vec![TransportEvent::AssistantText("long ".into())],
                vec![
                    TransportEvent::AssistantText("fresh".into()),
                    TransportEvent::TurnComplete,
                ],
            ],
            ..Default::default()
        }]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"message":"long job"}"#).await.unwrap();

        // Deliver the first streamed chunk.
        let (seq, ev) = h.evt_rx.recv().await.unwrap();
        h.session.handle_transport_event(seq, ev).await.unwrap();
        assert_eq!(next_chunk(&mut h).await.content, "long ");

        // Reset mid-turn: exactly one reset_complete, no further chunks
        // from the cancelled turn.
        h.session.handle_frame(r#"{"type":"reset"}"#).await.unwrap();
        assert_eq!(next_chunk(&mut h).await.kind, ChunkType::ResetComplete);

        // The cancelled turn's terminal event is queued with a stale turn
        // number; feeding it through must produce nothing.
        while let Ok(Some((seq, ev))) =
            tokio::time::timeout(Duration::from_millis(100), h.evt_rx.recv()).await
        {
            h.session.handle_transport_event(seq, ev).await.unwrap();
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.out_rx.recv())
                .await
                .is_err(),
            "no chunks may follow reset_complete from the cancelled turn"
        );

        // A new prompt starts a fresh turn.
        h.session.handle_frame(r#"{"message":"again"}"#).await.unwrap();
        let chunks = run_turn_to_terminal(&mut h).await;
        assert!(chunks.iter().any(|c| c.content == "fresh"));
    }

    // ── Model change ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_model_is_rejected_and_model_unchanged() {
        let mut h = harness(vec![ScriptedPlan::default()]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session
            .handle_frame(r#"{"type":"model_change","model":"frobnicator"}"#)
            .await
            .unwrap();
        let err = next_chunk(&mut h).await;
        assert_eq!(err.content, "unknown_model");
        assert!(err.completed);
        assert_eq!(h.session.model_id(), "auto");
        // No new transport was constructed for the rejected switch.
        assert_eq!(h.factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_change_builds_fresh_transport_and_reports_previous() {
        // claude-sonnet must probe available, so configure a key.
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".into());
        let mut h = harness_with(config, vec![ScriptedPlan::default(), ScriptedPlan::default()]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session
            .handle_frame(r#"{"type":"model_change","model":"claude-sonnet"}"#)
            .await
            .unwrap();
        let chunk = next_chunk(&mut h).await;
        assert_eq!(chunk.kind, ChunkType::ModelChanged);
        let meta = chunk.metadata.unwrap();
        assert_eq!(meta["model"]["id"], "claude-sonnet");
        assert_eq!(meta["model"]["isAuto"], false);
        assert_eq!(meta["previous"], "auto");
        assert_eq!(meta["archived_messages"].as_array().unwrap().len(), 0);
        assert_eq!(h.session.model_id(), "claude-sonnet");
        assert_eq!(h.factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(h.factory.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn switch_to_current_id_still_emits_model_changed_each_time() {
        let mut h = harness(vec![
            ScriptedPlan::default(),
            ScriptedPlan::default(),
            ScriptedPlan::default(),
        ]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        for _ in 0..2 {
            h.session
                .handle_frame(r#"{"type":"model_change","model":"auto"}"#)
                .await
                .unwrap();
            let chunk = next_chunk(&mut h).await;
            assert_eq!(chunk.kind, ChunkType::ModelChanged);
            assert_eq!(chunk.metadata.unwrap()["previous"], "auto");
        }
    }

    #[tokio::test]
    async fn mid_turn_model_change_archives_partial_text() {
        let mut h = harness(vec![
            ScriptedPlan::hanging_turns(vec![TransportEvent::AssistantText(
                "partial answer".into(),
            )]),
            ScriptedPlan::default(),
        ]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"message":"long job"}"#).await.unwrap();
        let (seq, ev) = h.evt_rx.recv().await.unwrap();
        h.session.handle_transport_event(seq, ev).await.unwrap();
        assert_eq!(next_chunk(&mut h).await.content, "partial answer");

        h.session
            .handle_frame(r#"{"type":"model_change","model":"auto"}"#)
            .await
            .unwrap();
        let chunk = next_chunk(&mut h).await;
        assert_eq!(chunk.kind, ChunkType::ModelChanged);
        let meta = chunk.metadata.unwrap();
        let archived = meta["archived_messages"].as_array().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0]["role"], "assistant");
        assert_eq!(archived[0]["content"], "partial answer");
        assert_eq!(h.session.archived().len(), 1);
        assert_eq!(h.session.phase(), Phase::Idle);
    }

    // ── Turn errors ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn backend_death_fails_turn_and_session_stays_open() {
        let mut h = harness(vec![
            ScriptedPlan {
                scripts: vec![vec![TransportEvent::TurnError {
                    kind: TurnErrorKind::ToolBackendUnavailable,
                    detail: "tool server exited during turn".into(),
                }]],
                ..Default::default()
            },
            ScriptedPlan::single_text_turn("back online"),
        ]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"message":"query"}"#).await.unwrap();
        let chunks = run_turn_to_terminal(&mut h).await;
        let last = chunks.last().unwrap();
        assert_eq!(last.content, "tool_backend_unavailable");
        assert!(last.completed);

        // Recovery via model change to the same id.
        h.session
            .handle_frame(r#"{"type":"model_change","model":"auto"}"#)
            .await
            .unwrap();
        assert_eq!(next_chunk(&mut h).await.kind, ChunkType::ModelChanged);

        h.session.handle_frame(r#"{"message":"query"}"#).await.unwrap();
        let chunks = run_turn_to_terminal(&mut h).await;
        assert!(chunks.iter().any(|c| c.content == "back online"));
    }

    #[tokio::test]
    async fn timeout_error_is_terminal() {
        let mut h = harness(vec![ScriptedPlan {
            scripts: vec![vec![TransportEvent::TurnError {
                kind: TurnErrorKind::Timeout,
                detail: "turn exceeded 180s budget".into(),
            }]],
            ..Default::default()
        }]);
        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;

        h.session.handle_frame(r#"{"message":"slow"}"#).await.unwrap();
        let chunks = run_turn_to_terminal(&mut h).await;
        let last = chunks.last().unwrap();
        assert_eq!(last.content, "timeout");
        assert!(last.completed);
        assert_eq!(h.session.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn error_details_are_sanitized() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-super-secret".into());
        let mut h = harness_with(
            config,
            vec![ScriptedPlan {
                scripts: vec![vec![TransportEvent::TurnError {
                    kind: TurnErrorKind::Internal,
                    detail: "request failed: key sk-super-secret rejected".into(),
                }]],
                ..Default::default()
            }],
        );

        h.session.start().await.unwrap();
        let _ = next_chunk(&mut h).await;
        h.session.handle_frame(r#"{"message":"q"}"#).await.unwrap();

        let (seq, ev) = h.evt_rx.recv().await.unwrap();
        h.session.handle_transport_event(seq, ev).await.unwrap();
        let err = next_chunk(&mut h).await;
        let detail = err.metadata.unwrap()["detail"].as_str().unwrap().to_string();
        assert!(!detail.contains("sk-super-secret"));
        assert!(detail.contains("[redacted]"));
    }

    // ── Slow consumer ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn saturated_outbound_queue_evicts_the_session() {
        let mut config = Config::default();
        config.server.stall_window_secs = 0; // stall immediately for the test
        let factory = Arc::new(ScriptedTransportFactory::new(vec![ScriptedPlan::default()]));
        // Queue of one, never drained: the second send must stall.
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (evt_tx, _evt_rx) = mpsc::channel(64);
        let mut session = Session::new(Arc::new(config), factory, out_tx, evt_tx);

        session.start().await.unwrap(); // fills the only slot with `connected`
        let result = session.handle_frame(r#"{"type":"reset"}"#).await;
        assert!(result.is_err(), "stalled send must end the session");

        // Whatever was queued first is still delivered in order.
        assert_eq!(out_rx.recv().await.unwrap().kind, ChunkType::Connected);
    }
}
