// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod events;
mod llm;
mod mcp;
mod mock;
mod prompts;
mod transport;

pub use error::TransportError;
pub use events::{TransportEvent, TurnErrorKind};
pub use llm::{LlmClient, LlmEvent, ToolSpec};
pub use mcp::{build_child_env, McpClient, ToolCallOutcome};
pub use mock::{ScriptedPlan, ScriptedTransport, ScriptedTransportFactory};
pub use transport::{AgentTransport, DirectTransport, DirectTransportFactory, TransportFactory};
