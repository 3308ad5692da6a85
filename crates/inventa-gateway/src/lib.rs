// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
pub mod http;
pub mod protocol;
pub mod sanitize;
pub mod session;
mod ws;

pub use error::GatewayError;
pub use http::{router, serve, AppState};
