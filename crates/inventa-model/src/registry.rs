// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model registry: static metadata for every model the gateway offers.
//!
//! This module is the single source of truth for which public model ids
//! exist, what vendor handle each one pins, and whether a model is usable
//! right now.  The public id is the stable handle clients see on the wire;
//! the vendor handle is internal and never echoed back.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use inventa_config::Config;

/// Ceiling on a single availability probe during `GET /models`.
/// A probe that exceeds it is reported unavailable rather than holding up
/// the whole listing.
const PROBE_CEILING: Duration = Duration::from_millis(500);

/// Metadata describing a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelEntry {
    /// Stable public id used on the wire (e.g. `"claude-sonnet"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// Provider identifier.
    pub provider: &'static str,
    /// Provider-specific handle pinned when this model is selected.
    /// `None` for the `auto` sentinel — the vendor SDK picks per turn.
    pub vendor_handle: Option<&'static str>,
    /// Total context window in tokens.
    pub context_length: u32,
}

impl ModelEntry {
    /// `true` for the sentinel entry that lets the vendor choose the model.
    pub fn is_auto(&self) -> bool {
        self.vendor_handle.is_none()
    }
}

/// Wire-facing descriptor returned by `GET /models`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: &'static str,
    pub available: bool,
    pub context_length: u32,
}

/// Complete registry.  `auto` is always first and always available.
pub static MODELS: &[ModelEntry] = &[
    ModelEntry {
        id: "auto",
        name: "Auto (vendor default)",
        provider: "anthropic",
        vendor_handle: None,
        context_length: 200_000,
    },
    ModelEntry {
        id: "claude-sonnet",
        name: "Claude Sonnet 4.5",
        provider: "anthropic",
        vendor_handle: Some("claude-sonnet-4-5"),
        context_length: 200_000,
    },
    ModelEntry {
        id: "claude-opus",
        name: "Claude Opus 4.6",
        provider: "anthropic",
        vendor_handle: Some("claude-opus-4-6"),
        context_length: 200_000,
    },
    ModelEntry {
        id: "claude-haiku",
        name: "Claude Haiku 4.5",
        provider: "anthropic",
        vendor_handle: Some("claude-haiku-4-5"),
        context_length: 200_000,
    },
];

/// Look up a model by its public id.  Returns `None` for unknown ids.
pub fn lookup(id: &str) -> Option<&'static ModelEntry> {
    MODELS.iter().find(|m| m.id == id)
}

/// Returns an iterator over all known public model ids.
pub fn known_model_ids() -> impl Iterator<Item = &'static str> {
    MODELS.iter().map(|m| m.id)
}

/// The entry used for new sessions: the configured `default_model` when it
/// names a known id, otherwise `auto`.
pub fn default_entry(config: &Config) -> &'static ModelEntry {
    lookup(&config.default_model).unwrap_or_else(|| {
        warn!(
            configured = %config.default_model,
            "default_model is not a known id, falling back to auto",
        );
        &MODELS[0]
    })
}

/// Whether `entry` is usable with the given configuration.
///
/// `auto` is always available.  Pinned entries require the provider's
/// credential to be configured.  The probe is deliberately cheap; the
/// per-probe ceiling in [`list_models`] guards against a future probe that
/// talks to the network.
pub async fn probe_available(entry: &ModelEntry, config: &Config) -> bool {
    if entry.is_auto() {
        return true;
    }
    match entry.provider {
        "anthropic" => config.llm.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        _ => false,
    }
}

/// All registry entries with runtime availability, for `GET /models`.
///
/// Each probe runs under [`PROBE_CEILING`]; overruns are logged and
/// reported as unavailable.
pub async fn list_models(config: &Config) -> Vec<ModelDescriptor> {
    let mut out = Vec::with_capacity(MODELS.len());
    for entry in MODELS {
        let available = match tokio::time::timeout(PROBE_CEILING, probe_available(entry, config))
            .await
        {
            Ok(v) => v,
            Err(_) => {
                warn!(model = entry.id, "availability probe exceeded ceiling");
                false
            }
        };
        out.push(ModelDescriptor {
            id: entry.id,
            name: entry.name,
            provider: entry.provider,
            available,
            context_length: entry.context_length,
        });
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
