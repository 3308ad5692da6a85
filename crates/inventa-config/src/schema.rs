// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_env_allowlist() -> Vec<String> {
    vec!["NETBOX_URL".to_string(), "NETBOX_TOKEN".to_string()]
}

fn default_tool_prefix() -> String {
    "netbox_".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

fn default_model() -> String {
    "auto".to_string()
}

fn default_turn_budget_secs() -> u64 {
    180
}

fn default_stall_window_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Immutable configuration snapshot for the whole gateway.
///
/// Loaded once at startup (see [`crate::load`]) and shared by reference.
/// There is no module-level mutable state; every component receives the
/// `Config` it needs through its constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tool_server: ToolServerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Public model id used for new sessions and as the fallback target
    /// when a model switch fails.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Wall-clock ceiling for a single turn, in seconds.
    #[serde(default = "default_turn_budget_secs")]
    pub turn_budget_secs: u64,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            tool_server: ToolServerConfig::default(),
            server: ServerConfig::default(),
            default_model: default_model(),
            turn_budget_secs: default_turn_budget_secs(),
            log: LogConfig::default(),
        }
    }
}

/// Credentials and endpoint for the LLM vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for the LLM vendor.  Required; may also be supplied via the
    /// `ANTHROPIC_API_KEY` environment variable when absent from the file.
    /// A value in the config file always wins over the ambient environment.
    pub api_key: Option<String>,
    /// Base URL override.  Useful for proxies and test servers.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
        }
    }
}

/// How to launch the MCP inventory tool server and what it may see.
///
/// The child process receives an environment built **from scratch** out of
/// `env_allowlist` keys with values taken from this struct — never from the
/// gateway's own environment.  An earlier design inherited the parent
/// environment and a stale shell token shadowed the configured one; the
/// explicit construction here is the contract that prevents that class of
/// bug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Executable that starts the MCP server, e.g. `"uvx"`.
    pub command: Option<String>,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment keys the child is allowed to receive.
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,
    /// Inventory API endpoint, exported to the child as `NETBOX_URL`.
    pub base_url: Option<String>,
    /// Inventory API token, exported to the child as `NETBOX_TOKEN`.
    /// May also be supplied via the `NETBOX_TOKEN` environment variable
    /// when absent from the file; the file value always wins.
    pub auth_token: Option<String>,
    /// Additional values for allowlisted keys that are not one of the two
    /// well-known ones above.  Keys not present in `env_allowlist` are
    /// ignored even if listed here.
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
    /// Only tools whose name starts with this prefix may be invoked by the
    /// model.  Empty string allows every tool the server advertises.
    #[serde(default = "default_tool_prefix")]
    pub tool_prefix: String,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env_allowlist: default_env_allowlist(),
            base_url: None,
            auth_token: None,
            extra_env: HashMap::new(),
            tool_prefix: default_tool_prefix(),
        }
    }
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `"127.0.0.1:8765"`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Origins allowed on HTTP endpoints and WebSocket upgrades.
    /// Requests carrying a different `Origin` header are refused with 403
    /// before any upgrade happens.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// How long an outbound send may stall on a slow client before the
    /// session is evicted, in seconds.
    #[serde(default = "default_stall_window_secs")]
    pub stall_window_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
            stall_window_secs: default_stall_window_secs(),
        }
    }
}

/// Diagnostic verbosity only; never alters behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default tracing filter: "error" | "warn" | "info" | "debug" | "trace".
    /// `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),
}

impl Config {
    /// Fill credential fields from the ambient environment **only** where
    /// the config file left them unset.  File values always win, so a stale
    /// shell variable can never shadow an explicitly configured secret.
    pub fn apply_env_fallbacks(&mut self) {
        if self.llm.api_key.is_none() {
            self.llm.api_key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|v| !v.is_empty());
        }
        if self.tool_server.base_url.is_none() {
            self.tool_server.base_url =
                std::env::var("NETBOX_URL").ok().filter(|v| !v.is_empty());
        }
        if self.tool_server.auth_token.is_none() {
            self.tool_server.auth_token =
                std::env::var("NETBOX_TOKEN").ok().filter(|v| !v.is_empty());
        }
    }

    /// Check that every required key is present.
    ///
    /// Collects **all** missing keys so the operator fixes the config in one
    /// round trip instead of replaying startup once per key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.llm.api_key.as_deref().unwrap_or("").is_empty() {
            missing.push("llm.api_key (or ANTHROPIC_API_KEY)");
        }
        if self.tool_server.command.as_deref().unwrap_or("").is_empty() {
            missing.push("tool_server.command");
        }
        if self.tool_server.base_url.as_deref().unwrap_or("").is_empty() {
            missing.push("tool_server.base_url (or NETBOX_URL)");
        }
        if self.tool_server.auth_token.as_deref().unwrap_or("").is_empty() {
            missing.push("tool_server.auth_token (or NETBOX_TOKEN)");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingKeys(missing))
        }
    }

    /// Per-turn wall-time ceiling.
    pub fn turn_budget(&self) -> Duration {
        Duration::from_secs(self.turn_budget_secs)
    }

    /// Outbound stall window before a slow consumer is evicted.
    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.server.stall_window_secs)
    }

    /// Every secret value known to the configuration, for the error/log
    /// sanitizer.  Order is irrelevant; empty strings are skipped.
    pub fn credential_values(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(k) = &self.llm.api_key {
            out.push(k.clone());
        }
        if let Some(t) = &self.tool_server.auth_token {
            out.push(t.clone());
        }
        for v in self.tool_server.extra_env.values() {
            out.push(v.clone());
        }
        out.retain(|v| !v.is_empty());
        out
    }

    /// Clone with secrets replaced, for `inventa show-config`.
    pub fn redacted(&self) -> Config {
        let mut c = self.clone();
        if c.llm.api_key.is_some() {
            c.llm.api_key = Some("[redacted]".to_string());
        }
        if c.tool_server.auth_token.is_some() {
            c.tool_server.auth_token = Some("[redacted]".to_string());
        }
        for v in c.tool_server.extra_env.values_mut() {
            *v = "[redacted]".to_string();
        }
        c
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
