// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire protocol between chat clients and the gateway.
//!
//! Everything is UTF-8 JSON, one frame per WebSocket text message.  This
//! module is the single place where the wire shapes live; the session and
//! HTTP layers consume the typed records and never touch raw JSON.
//!
//! # Typical exchange
//!
//! ```text
//! Client                               Gateway
//!    │                                    │
//!    │◄─ {"type":"connected",…} ──────────│  first frame, always
//!    │── {"message":"which racks…"} ─────►│
//!    │◄─ {"type":"text","completed":false}│  × N streamed chunks
//!    │◄─ {"type":"tool_use",…} ───────────│  (when the agent calls a tool)
//!    │◄─ {"type":"text","completed":true} │  terminal marker
//!    │                                    │
//!    │── {"type":"model_change",…} ──────►│
//!    │◄─ {"type":"model_changed",…} ──────│  terminal for the switch
//! ```
//!
//! Inbound parsing is strict: unknown `type` values are rejected, a prompt
//! needs a non-empty `message`.  Unknown *fields* are tolerated so older
//! gateways keep working against newer clients.  Outbound chunks only ever
//! use the types below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use inventa_agent::TurnErrorKind;
use inventa_model::ModelEntry;

// ── Server → client chunks ────────────────────────────────────────────────────

/// Discriminator for one server-to-client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Connected,
    Text,
    ToolUse,
    ToolResult,
    Thinking,
    Error,
    ResetComplete,
    ModelChanged,
}

/// A single server-to-client frame.
///
/// `completed == true` appears only on the terminal `text` or `error`
/// chunk of a turn; every other type always carries `false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub kind: ChunkType,
    pub content: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StreamChunk {
    /// The mandatory first frame of every accepted WebSocket.
    pub fn connected(banner: &str, model: &ModelEntry) -> Self {
        Self {
            kind: ChunkType::Connected,
            content: banner.to_string(),
            completed: false,
            metadata: Some(json!({ "model": model_metadata(model) })),
        }
    }

    pub fn text_delta(content: impl Into<String>) -> Self {
        Self {
            kind: ChunkType::Text,
            content: content.into(),
            completed: false,
            metadata: None,
        }
    }

    /// Terminal marker closing a successful turn.
    pub fn text_terminal() -> Self {
        Self {
            kind: ChunkType::Text,
            content: String::new(),
            completed: true,
            metadata: None,
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: ChunkType::Thinking,
            content: content.into(),
            completed: false,
            metadata: None,
        }
    }

    pub fn tool_use(name: impl Into<String>) -> Self {
        Self {
            kind: ChunkType::ToolUse,
            content: name.into(),
            completed: false,
            metadata: None,
        }
    }

    pub fn tool_result(payload: impl Into<String>) -> Self {
        Self {
            kind: ChunkType::ToolResult,
            content: payload.into(),
            completed: false,
            metadata: None,
        }
    }

    /// An error chunk.  `content` is the stable taxonomy token; the
    /// (already sanitized) human detail travels in `metadata.detail`.
    pub fn error(kind: ErrorKind, detail: &str, completed: bool) -> Self {
        let metadata = if detail.is_empty() {
            None
        } else {
            Some(json!({ "detail": detail }))
        };
        Self {
            kind: ChunkType::Error,
            content: kind.as_str().to_string(),
            completed,
            metadata,
        }
    }

    /// Terminal chunk for a `reset` control frame.
    pub fn reset_complete() -> Self {
        Self {
            kind: ChunkType::ResetComplete,
            content: "ok".to_string(),
            completed: false,
            metadata: None,
        }
    }

    /// Terminal chunk for a `model_change` control frame.
    pub fn model_changed(model: &ModelEntry, previous: &str, archived: &[ChatMessage]) -> Self {
        Self {
            kind: ChunkType::ModelChanged,
            content: format!("now using {}", model.name),
            completed: false,
            metadata: Some(json!({
                "model": model_metadata(model),
                "previous": previous,
                "archived_messages": archived,
            })),
        }
    }

    /// `true` for the frame that ends the current turn.
    pub fn is_terminal(&self) -> bool {
        self.completed
            || matches!(self.kind, ChunkType::ResetComplete | ChunkType::ModelChanged)
    }
}

fn model_metadata(model: &ModelEntry) -> Value {
    json!({
        "id": model.id,
        "name": model.name,
        "isAuto": model.is_auto(),
    })
}

// ── Client → server frames ────────────────────────────────────────────────────

/// One inbound frame.  Exactly one shape per JSON object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// `{"message": "<text>"}` — a chat prompt.
    Prompt { message: String },
    /// `{"type": "reset"}` — cancel the current turn and clear context.
    Reset,
    /// `{"type": "model_change", "model": "<id>"}`.
    ModelChange { model: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    #[error("model_change requires a non-empty `model` string")]
    MissingModel,

    #[error("prompt requires a non-empty `message` string")]
    EmptyMessage,

    #[error("frame has neither `type` nor `message`")]
    UnknownShape,
}

/// Parse one inbound text frame.
///
/// Unknown fields are ignored; unknown `type` values and malformed shapes
/// are rejected.  The caller answers rejections with a single
/// `error(bad_frame)` chunk and keeps the connection open.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let v: Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let Some(obj) = v.as_object() else {
        return Err(FrameError::NotAnObject);
    };

    if let Some(t) = obj.get("type") {
        return match t.as_str() {
            Some("reset") => Ok(ClientFrame::Reset),
            Some("model_change") => obj
                .get("model")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|m| ClientFrame::ModelChange {
                    model: m.to_string(),
                })
                .ok_or(FrameError::MissingModel),
            Some(other) => Err(FrameError::UnknownType(other.to_string())),
            None => Err(FrameError::UnknownType("<non-string>".to_string())),
        };
    }

    match obj.get("message").and_then(Value::as_str) {
        Some(m) if !m.trim().is_empty() => Ok(ClientFrame::Prompt {
            message: m.to_string(),
        }),
        Some(_) => Err(FrameError::EmptyMessage),
        None if obj.contains_key("message") => Err(FrameError::EmptyMessage),
        None => Err(FrameError::UnknownShape),
    }
}

// ── Error taxonomy ────────────────────────────────────────────────────────────

/// Stable error tokens used in logs and in `error` chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadFrame,
    Busy,
    UnknownModel,
    ModelUnavailable,
    ToolBackendUnavailable,
    ToolNotAllowed,
    Timeout,
    Cancelled,
    SlowConsumer,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadFrame => "bad_frame",
            ErrorKind::Busy => "busy",
            ErrorKind::UnknownModel => "unknown_model",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ToolBackendUnavailable => "tool_backend_unavailable",
            ErrorKind::ToolNotAllowed => "tool_not_allowed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::Internal => "internal",
        }
    }
}

impl From<TurnErrorKind> for ErrorKind {
    fn from(kind: TurnErrorKind) -> Self {
        match kind {
            TurnErrorKind::ToolBackendUnavailable => ErrorKind::ToolBackendUnavailable,
            TurnErrorKind::ToolNotAllowed => ErrorKind::ToolNotAllowed,
            TurnErrorKind::Timeout => ErrorKind::Timeout,
            TurnErrorKind::Cancelled => ErrorKind::Cancelled,
            TurnErrorKind::Internal => ErrorKind::Internal,
        }
    }
}

// ── Archived messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A message synthesized by the session (clients archive their own).
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
