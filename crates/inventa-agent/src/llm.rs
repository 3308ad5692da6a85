// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming client for the Anthropic Messages API.
//!
//! One [`LlmClient`] is owned by each direct transport and keyed by a vendor
//! model handle.  Conversation history lives in the transport (already in
//! wire format); this module only performs the HTTP round trip and turns the
//! SSE byte stream into typed [`LlmEvent`]s.
//!
//! Unknown vendor event variants are dropped (as empty text deltas) with a
//! debug log rather than surfaced, so SDK-side additions do not destabilize
//! the gateway's wire protocol.

use std::pin::Pin;

use anyhow::{bail, Context};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

/// Vendor handle used when the public id is `auto`: the vendor's current
/// default chat model, chosen server-side.
const AUTO_VENDOR_HANDLE: &str = "claude-sonnet-4-5";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// One parsed server-sent event from the Messages stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmEvent {
    /// A chunk of assistant answer text.  May be empty for vendor events
    /// that carry nothing we surface.
    TextDelta(String),
    /// A chunk of extended-thinking text.
    ThinkingDelta(String),
    /// A tool invocation, streamed incrementally: the first event for an
    /// `index` carries `id` and `name` with empty `arguments`; subsequent
    /// events carry argument JSON fragments with empty `id`/`name`.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The message finished.
    Done,
}

pub type LlmStream = Pin<Box<dyn Stream<Item = anyhow::Result<LlmEvent>> + Send>>;

/// A tool definition advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Streaming Messages API client.  Cheap to clone; the underlying
/// `reqwest::Client` shares its connection pool.
#[derive(Clone)]
pub struct LlmClient {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    /// Build a client pinned to `vendor_handle`, or to the vendor default
    /// when `None` (the `auto` public id).
    pub fn new(vendor_handle: Option<&str>, api_key: String, base_url: String) -> Self {
        Self {
            model: vendor_handle.unwrap_or(AUTO_VENDOR_HANDLE).to_string(),
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one streaming completion request.
    ///
    /// `messages` must already be in Anthropic wire format (the transport
    /// keeps its history that way).  The returned stream yields events until
    /// [`LlmEvent::Done`]; transport errors surface as `Err` items.
    pub async fn stream_completion(
        &self,
        system: &str,
        messages: &[Value],
        tools: &[ToolSpec],
    ) -> anyhow::Result<LlmStream> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            let tool_values: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tool_values);
        }

        debug!(model = %self.model, tools = tools.len(), "sending completion request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("LLM error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete '\n'-terminated lines are parsed.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            events.push(Ok(parse_stream_event(&v)));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Map one vendor SSE payload onto an [`LlmEvent`].
///
/// Ordering is preserved by construction (one event in, one event out);
/// vendor variants we do not recognize become empty text deltas so the
/// stream shape stays stable across SDK updates.
pub(crate) fn parse_stream_event(v: &Value) -> LlmEvent {
    let event_type = v["type"].as_str().unwrap_or("");
    match event_type {
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    LlmEvent::TextDelta(delta["text"].as_str().unwrap_or("").to_string())
                }
                "input_json_delta" => LlmEvent::ToolCall {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                },
                "thinking_delta" => {
                    let thinking = delta["thinking"].as_str().unwrap_or("").to_string();
                    if thinking.is_empty() {
                        LlmEvent::TextDelta(String::new())
                    } else {
                        LlmEvent::ThinkingDelta(thinking)
                    }
                }
                // Signature blobs close every thinking block; they are not
                // human-readable and must never reach clients or logs.
                "signature_delta" => LlmEvent::TextDelta(String::new()),
                other => {
                    debug!(variant = other, "dropping unknown content delta");
                    LlmEvent::TextDelta(String::new())
                }
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                LlmEvent::ToolCall {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }
            } else {
                LlmEvent::TextDelta(String::new())
            }
        }
        "message_stop" => LlmEvent::Done,
        // message_start / message_delta carry usage accounting we do not
        // forward; ping keeps the connection warm.
        "message_start" | "message_delta" | "ping" => LlmEvent::TextDelta(String::new()),
        other => {
            debug!(variant = other, "dropping unknown stream event");
            LlmEvent::TextDelta(String::new())
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_handle_used_when_no_pin() {
        let c = LlmClient::new(None, "k".into(), "http://x".into());
        assert_eq!(c.model(), AUTO_VENDOR_HANDLE);
    }

    #[test]
    fn pinned_handle_wins() {
        let c = LlmClient::new(Some("claude-opus-4-6"), "k".into(), "http://x".into());
        assert_eq!(c.model(), "claude-opus-4-6");
    }

    #[test]
    fn text_delta_parses() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "Hi"}
        });
        assert_eq!(parse_stream_event(&v), LlmEvent::TextDelta("Hi".into()));
    }

    #[test]
    fn thinking_delta_parses() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "thinking_delta", "thinking": "hmm"}
        });
        assert_eq!(parse_stream_event(&v), LlmEvent::ThinkingDelta("hmm".into()));
    }

    #[test]
    fn empty_thinking_delta_is_empty_text() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "thinking_delta", "thinking": ""}
        });
        assert_eq!(parse_stream_event(&v), LlmEvent::TextDelta(String::new()));
    }

    #[test]
    fn tool_use_start_carries_id_and_name() {
        let v = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {"type": "tool_use", "id": "tu_1", "name": "netbox_get_devices"}
        });
        match parse_stream_event(&v) {
            LlmEvent::ToolCall {
                index, id, name, arguments,
            } => {
                assert_eq!(index, 1);
                assert_eq!(id, "tu_1");
                assert_eq!(name, "netbox_get_devices");
                assert!(arguments.is_empty());
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn input_json_delta_carries_fragment() {
        let v = json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"site\":"}
        });
        match parse_stream_event(&v) {
            LlmEvent::ToolCall { index, arguments, id, name } => {
                assert_eq!(index, 1);
                assert_eq!(arguments, "{\"site\":");
                assert!(id.is_empty());
                assert!(name.is_empty());
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn signature_delta_is_silently_discarded() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "signature_delta", "signature": "AAAA"}
        });
        assert_eq!(parse_stream_event(&v), LlmEvent::TextDelta(String::new()));
    }

    #[test]
    fn message_stop_is_done() {
        let v = json!({"type": "message_stop"});
        assert_eq!(parse_stream_event(&v), LlmEvent::Done);
    }

    #[test]
    fn unknown_event_type_is_dropped() {
        let v = json!({"type": "brand_new_vendor_event"});
        assert_eq!(parse_stream_event(&v), LlmEvent::TextDelta(String::new()));
    }

    #[test]
    fn text_block_start_is_empty_delta() {
        let v = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""}
        });
        assert_eq!(parse_stream_event(&v), LlmEvent::TextDelta(String::new()));
    }
}
