// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Detail-string sanitization: strip configured credentials before any
//! error detail leaves the gateway.
//!
//! Vendor SDK errors and subprocess diagnostics sometimes echo request
//! headers or the child environment back at us.  Every outbound detail
//! string passes through [`Sanitizer::scrub`] so a configured secret can
//! never reach a client or the log.

use inventa_config::Config;

/// Secrets shorter than this are ignored — replacing 1–3 character values
/// would mangle ordinary text far more often than it would protect anything.
const MIN_SECRET_LEN: usize = 4;

const REDACTED: &str = "[redacted]";

/// Holds every secret value known to the configuration.
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    secrets: Vec<String>,
}

impl Sanitizer {
    pub fn from_config(config: &Config) -> Self {
        let mut secrets: Vec<String> = config
            .credential_values()
            .into_iter()
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first, so a secret that is a prefix of another cannot
        // leave a recognizable suffix behind.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    /// Replace every occurrence of every known secret with `[redacted]`.
    pub fn scrub(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        let mut c = Config::default();
        c.llm.api_key = Some("sk-ant-secret-key".into());
        c.tool_server.auth_token = Some("nb-token-9000".into());
        Sanitizer::from_config(&c)
    }

    #[test]
    fn api_key_is_redacted() {
        let s = sanitizer();
        assert_eq!(
            s.scrub("request failed: x-api-key sk-ant-secret-key rejected"),
            "request failed: x-api-key [redacted] rejected"
        );
    }

    #[test]
    fn every_occurrence_is_redacted() {
        let s = sanitizer();
        let out = s.scrub("nb-token-9000 then nb-token-9000 again");
        assert!(!out.contains("nb-token-9000"));
        assert_eq!(out.matches(REDACTED).count(), 2);
    }

    #[test]
    fn clean_input_passes_through() {
        let s = sanitizer();
        assert_eq!(s.scrub("device core-sw-01 not found"), "device core-sw-01 not found");
    }

    #[test]
    fn short_values_are_not_treated_as_secrets() {
        let mut c = Config::default();
        c.llm.api_key = Some("ok".into());
        let s = Sanitizer::from_config(&c);
        assert_eq!(s.scrub("everything is ok"), "everything is ok");
    }

    #[test]
    fn extra_env_values_are_redacted() {
        let mut c = Config::default();
        c.tool_server
            .extra_env
            .insert("NETBOX_EXTRA".into(), "hidden-value".into());
        let s = Sanitizer::from_config(&c);
        assert_eq!(s.scrub("env dump: hidden-value"), "env dump: [redacted]");
    }
}
