// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/inventa/config.yaml"));
    paths.push(PathBuf::from("/etc/inventa/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/inventa/config.yaml"));
        paths.push(home.join(".config/inventa/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("inventa/config.yaml"));
        paths.push(cfg.join("inventa/config.yml"));
    }

    // 3. Working-directory-local
    paths.push(PathBuf::from(".inventa.yaml"));
    paths.push(PathBuf::from(".inventa.yml"));
    paths.push(PathBuf::from("inventa.yaml"));
    paths.push(PathBuf::from("inventa.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then filling
/// unset credentials from the ambient environment (file values win).
///
/// The `extra` argument may provide an explicit path (the `--config` CLI
/// flag); it is the highest-priority layer and must exist when given.
///
/// Validation is a separate step — callers decide when to fail fast:
/// `inventa serve` aborts on [`Config::validate`] errors, while
/// `inventa show-config` prints whatever was loaded.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("invalid configuration")?
    };
    config.apply_env_fallbacks();
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("server:\n  bind: 127.0.0.1:8765\n  stall_window_secs: 15");
        let src = val("server:\n  bind: 0.0.0.0:9000");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["server"]["bind"].as_str(), Some("0.0.0.0:9000"));
        assert_eq!(dst["server"]["stall_window_secs"].as_i64(), Some(15));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/inventa_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "default_model: claude-opus\nturn_budget_secs: 42\ntool_server:\n  command: uvx"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.default_model, "claude-opus");
        assert_eq!(cfg.turn_budget_secs, 42);
        assert_eq!(cfg.tool_server.command.as_deref(), Some("uvx"));
    }

    #[test]
    fn load_rejects_malformed_yaml() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "default_model: [unclosed").unwrap();
        assert!(load(Some(f.path())).is_err());
    }

    #[test]
    fn file_value_wins_over_ambient_environment() {
        use std::io::Write;
        // The regression this guards: a stale shell token must never shadow
        // the configured one.
        std::env::set_var("NETBOX_TOKEN", "ambient-shell-token");
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "tool_server:\n  auth_token: configured-token").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(
            cfg.tool_server.auth_token.as_deref(),
            Some("configured-token")
        );
        std::env::remove_var("NETBOX_TOKEN");
    }
}
