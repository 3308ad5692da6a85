// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Faults surfaced by transport operations (as opposed to turn-level
/// failures, which arrive as [`crate::TransportEvent::TurnError`]).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("a turn is already in flight")]
    TurnInFlight,

    #[error("tool backend unavailable: {0}")]
    Backend(String),

    #[error("transport has failed; only close is legal")]
    Failed,
}
