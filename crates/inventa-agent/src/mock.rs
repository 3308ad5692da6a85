// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted transport for tests.  No network, no subprocess.
//!
//! Each call to `submit` pops the next event script from the front of the
//! queue and replays it through the per-turn channel.  A script without a
//! terminal event models a long-running turn: the task parks until the
//! session cancels it, then emits `TurnError(cancelled)` — exactly the
//! contract a real transport honours.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use inventa_model::ModelEntry;

use crate::{
    error::TransportError,
    events::{TransportEvent, TurnErrorKind},
    transport::{AgentTransport, TransportFactory},
};

/// What one factory-built transport should do.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlan {
    /// Ordered scripts, one per expected `submit`.
    pub scripts: Vec<Vec<TransportEvent>>,
    /// When set, `open` fails with this detail.
    pub open_error: Option<String>,
    /// Pause before each scripted event (lets tests interleave frames).
    pub step_delay: Duration,
}

impl ScriptedPlan {
    /// A plan whose single turn streams `text` and completes.
    pub fn single_text_turn(text: &str) -> Self {
        Self {
            scripts: vec![vec![
                TransportEvent::AssistantText(text.to_string()),
                TransportEvent::TurnComplete,
            ]],
            ..Default::default()
        }
    }

    /// A plan whose turns never terminate on their own (cancel-only).
    pub fn hanging_turns(leading: Vec<TransportEvent>) -> Self {
        Self {
            scripts: vec![leading],
            ..Default::default()
        }
    }
}

/// Test transport driven by a [`ScriptedPlan`].
pub struct ScriptedTransport {
    scripts: VecDeque<Vec<TransportEvent>>,
    open_error: Option<String>,
    step_delay: Duration,
    opened: bool,
    failed: bool,
    turn: Option<ScriptedTurn>,
    resets: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

struct ScriptedTurn {
    cancel: CancellationToken,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ScriptedTransport {
    fn new(plan: ScriptedPlan, resets: Arc<AtomicUsize>, closes: Arc<AtomicUsize>) -> Self {
        Self {
            scripts: plan.scripts.into(),
            open_error: plan.open_error,
            step_delay: plan.step_delay,
            opened: false,
            failed: false,
            turn: None,
            resets,
            closes,
        }
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if let Some(detail) = &self.open_error {
            return Err(TransportError::Backend(detail.clone()));
        }
        self.opened = true;
        Ok(())
    }

    fn submit(&mut self, _prompt: &str) -> Result<(), TransportError> {
        if self.failed {
            return Err(TransportError::Failed);
        }
        if !self.opened {
            return Err(TransportError::NotOpen);
        }
        if self
            .turn
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
        {
            return Err(TransportError::TurnInFlight);
        }

        let script = self.scripts.pop_front().unwrap_or_default();
        // A scripted backend failure latches the transport like the real one.
        if script.iter().any(|ev| {
            matches!(
                ev,
                TransportEvent::TurnError {
                    kind: TurnErrorKind::ToolBackendUnavailable,
                    ..
                }
            )
        }) {
            self.failed = true;
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let delay = self.step_delay;
        let handle = tokio::spawn(replay_script(script, delay, cancel.clone(), tx));
        self.turn = Some(ScriptedTurn {
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
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            let _ = turn.handle.await;
        }
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            let _ = turn.handle.await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

async fn replay_script(
    script: Vec<TransportEvent>,
    delay: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<TransportEvent>,
) {
    for event in script {
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        let terminal = matches!(
            event,
            TransportEvent::TurnComplete | TransportEvent::TurnError { .. }
        );
        if tx.send(event).await.is_err() {
            return;
        }
        if terminal {
            return;
        }
    }
    // No terminal event scripted (or cancelled mid-script): park until the
    // session cancels, then terminate the stream the way a real turn does.
    cancel.cancelled().await;
    let _ = tx
        .send(TransportEvent::TurnError {
            kind: TurnErrorKind::Cancelled,
            detail: "turn cancelled".to_string(),
        })
        .await;
}

/// Factory yielding one [`ScriptedTransport`] per queued plan.
///
/// Counters expose how many transports were built, reset, and closed so
/// tests can assert the session's lifecycle invariants (one transport per
/// switch, no leaks on teardown).
pub struct ScriptedTransportFactory {
    plans: Mutex<VecDeque<ScriptedPlan>>,
    pub builds: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedTransportFactory {
    pub fn new(plans: Vec<ScriptedPlan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            builds: Arc::new(AtomicUsize::new(0)),
            resets: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn build(&self, _entry: &'static ModelEntry) -> Box<dyn AgentTransport> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .expect("plans lock")
            .pop_front()
            .unwrap_or_default();
        Box::new(ScriptedTransport::new(
            plan,
            self.resets.clone(),
            self.closes.clone(),
        ))
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
