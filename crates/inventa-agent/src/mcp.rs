// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minimal async client for the Model Context Protocol over stdio.
//!
//! The client spawns the configured inventory tool server as a child
//! process and speaks line-delimited JSON-RPC 2.0 on its standard streams.
//! It supports exactly what the transport needs: the `initialize`
//! handshake, `tools/list`, and `tools/call`.
//!
//! # Child environment
//!
//! The child's environment is constructed **from scratch** by
//! [`build_child_env`]: `env_clear()` plus exactly the allowlisted keys
//! with values taken from configuration.  Variables present in the
//! gateway's own environment never reach the child.
//!
//! # Supervision
//!
//! A supervisor task owns the `Child`.  It reports unexpected exits
//! through a watch channel (the transport fails the turn on it) and
//! performs requested shutdowns with escalation: SIGTERM, a bounded grace
//! window, then SIGKILL.  [`McpClient::shutdown`] therefore never blocks
//! indefinitely.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use inventa_config::ToolServerConfig;

use crate::llm::ToolSpec;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Capacity of the channel feeding the child's stdin.
const OUTGOING_CAPACITY: usize = 64;

/// Ceiling on a single JSON-RPC round trip.  Inventory queries can be slow
/// but anything beyond this means the server is wedged.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a SIGTERM'd child gets before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

type PendingSender = oneshot::Sender<Value>;

/// Build the child process environment from configuration alone.
///
/// Only keys named in `env_allowlist` are emitted; values come from the
/// config struct, never from `std::env`.  Allowlisted keys with no
/// configured value are simply absent.
pub fn build_child_env(cfg: &ToolServerConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in &cfg.env_allowlist {
        let value = match key.as_str() {
            "NETBOX_URL" => cfg.base_url.clone(),
            "NETBOX_TOKEN" => cfg.auth_token.clone(),
            other => cfg.extra_env.get(other).cloned(),
        };
        if let Some(v) = value {
            env.insert(key.clone(), v);
        }
    }
    env
}

/// Outcome of a `tools/call` round trip.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    /// Flattened text content of the result.
    pub text: String,
    /// The server-side `isError` flag.
    pub is_error: bool,
}

/// A running MCP client instance.  Cheap to share behind an `Arc`.
pub struct McpClient {
    outgoing_tx: mpsc::Sender<Value>,
    pending: Arc<Mutex<HashMap<i64, PendingSender>>>,
    id_counter: AtomicI64,
    exit_rx: watch::Receiver<bool>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl McpClient {
    /// Spawn the configured tool server and wire up the IO tasks.
    ///
    /// Does not perform the MCP handshake; call [`initialize`](Self::initialize)
    /// next.  On spawn failure nothing is left running.
    pub async fn spawn(cfg: &ToolServerConfig) -> anyhow::Result<Self> {
        let command = cfg
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .context("tool_server.command is not configured")?;

        let mut child = Command::new(command)
            .args(&cfg.args)
            .env_clear()
            .envs(build_child_env(cfg))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Tokio makes a best effort to reap-after-exit so the child does
            // not outlive a dropped client.
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start tool server `{command}`"))?;

        let stdin = child
            .stdin
            .take()
            .context("failed to capture tool server stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture tool server stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("failed to capture tool server stderr")?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Value>(OUTGOING_CAPACITY);
        let pending: Arc<Mutex<HashMap<i64, PendingSender>>> = Arc::new(Mutex::new(HashMap::new()));

        // Writer: serialize outgoing messages onto the child's stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = outgoing_rx.recv().await {
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                debug!(msg = %json, "mcp send");
                if stdin.write_all(json.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
        });

        // Reader: dispatch line-delimited responses to their callers.
        {
            let pending = pending.clone();
            let mut lines = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(msg = %line, "mcp recv");
                    let Ok(v) = serde_json::from_str::<Value>(&line) else {
                        warn!("tool server sent unparseable line");
                        continue;
                    };
                    if let Some(id) = v["id"].as_i64() {
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(v);
                        }
                    } else if v.get("method").is_some() {
                        // Server-initiated notifications are logged only.
                        debug!(method = %v["method"], "mcp notification");
                    }
                }
            });
        }

        // Stderr: fold the child's diagnostics into our log under a
        // dedicated target so operators can filter it.
        {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "inventa::mcp::stderr", "{line}");
                }
            });
        }

        // Supervisor: owns the child, reports exits, performs shutdowns.
        let (exit_tx, exit_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<oneshot::Sender<()>>(1);
        let pid = child.id();
        tokio::spawn(async move {
            // First wait for either an exit or a shutdown request, then act
            // on the child sequentially — the select itself must not touch
            // the child outside its polled future.
            let mut requested: Option<oneshot::Sender<()>> = None;
            let unexpected = tokio::select! {
                status = child.wait() => Some(status),
                maybe = shutdown_rx.recv() => {
                    requested = maybe;
                    None
                }
            };

            match unexpected {
                Some(Ok(s)) => warn!(status = %s, "tool server exited unexpectedly"),
                Some(Err(e)) => warn!("tool server wait failed: {e}"),
                None => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        // Graceful stop first; the grace window below bounds it.
                        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                    }
                    #[cfg(not(unix))]
                    let _ = pid;
                    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                        Ok(Ok(s)) => info!(status = %s, "tool server stopped"),
                        Ok(Err(e)) => warn!("tool server wait failed: {e}"),
                        Err(_) => {
                            warn!("tool server ignored SIGTERM, killing");
                            let _ = child.kill().await;
                        }
                    }
                }
            }
            let _ = exit_tx.send(true);
            if let Some(done) = requested {
                let _ = done.send(());
            }
        });

        Ok(Self {
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
            exit_rx,
            shutdown_tx,
        })
    }

    /// `true` once the child has terminated, expectedly or not.
    pub fn has_exited(&self) -> bool {
        *self.exit_rx.borrow()
    }

    /// Watch half for `select!`-style liveness monitoring during a turn.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_rx.clone()
    }

    /// Perform the MCP handshake.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "inventa",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        debug!(server = %result["serverInfo"]["name"], "mcp initialized");
        self.notify("notifications/initialized", json!({})).await
    }

    /// Fetch the tool definitions the server advertises.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .context("tools/list result has no tools array")?
            .iter()
            .map(|t| ToolSpec {
                name: t["name"].as_str().unwrap_or("").to_string(),
                description: t["description"].as_str().unwrap_or("").to_string(),
                input_schema: t
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
            .filter(|t| !t.name.is_empty())
            .collect();
        Ok(tools)
    }

    /// Invoke one tool and flatten its result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<ToolCallOutcome> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        Ok(flatten_tool_result(&result))
    }

    /// Request a shutdown and wait for the child to be reaped.
    ///
    /// Bounded by the grace window plus a small margin; safe to call when
    /// the child is already gone.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.shutdown_tx.send(done_tx).await.is_err() {
            // Supervisor already finished — the child has exited.
            return;
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(2), done_rx).await;
    }

    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        if self.has_exited() {
            bail!("tool server is not running");
        }
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self
            .outgoing_tx
            .send(rpc_request(id, method, params))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            bail!("tool server is not running");
        }

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(v)) => v,
            Ok(Err(_)) => bail!("tool server closed the connection"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("tool server did not answer `{method}` in time");
            }
        };

        if let Some(err) = reply.get("error") {
            bail!(
                "tool server error on `{method}`: {}",
                err["message"].as_str().unwrap_or("unknown")
            );
        }
        Ok(reply["result"].clone())
    }

    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.outgoing_tx
            .send(rpc_notification(method, params))
            .await
            .map_err(|_| anyhow::anyhow!("tool server is not running"))
    }
}

fn rpc_request(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn rpc_notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// Join the text parts of a `tools/call` result into one payload string.
fn flatten_tool_result(result: &Value) -> ToolCallOutcome {
    let text = result["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p["type"].as_str() == Some("text"))
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    ToolCallOutcome {
        text,
        is_error: result["isError"].as_bool().unwrap_or(false),
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
