// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod registry;

pub use registry::{
    default_entry, known_model_ids, list_models, lookup, probe_available, ModelDescriptor,
    ModelEntry, MODELS,
};
