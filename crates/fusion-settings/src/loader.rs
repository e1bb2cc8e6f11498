//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FusionSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::FusionSettings;

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If
/// the file contains invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<FusionSettings> {
    let mut settings = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        merge_over_defaults(user)?
    } else {
        debug!(?path, "settings file not found, using defaults");
        FusionSettings::default()
    };
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Deep-merge a JSON override over the compiled defaults.
///
/// The override is always applied to the defaults, never to a previously
/// merged value: the last override wins as a whole.
pub fn merge_over_defaults(overrides: Value) -> Result<FusionSettings> {
    merge_settings(&FusionSettings::default(), overrides)
}

/// Deep-merge a JSON override over an explicit base.
pub fn merge_settings(base: &FusionSettings, overrides: Value) -> Result<FusionSettings> {
    let base = serde_json::to_value(base)?;
    let merged = deep_merge(base, overrides);
    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// - `FUSION_URI`: socket endpoint (non-empty string)
/// - `FUSION_WAIT_MS`: throttle window, `0..=600000`
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut FusionSettings) {
    if let Some(v) = read_env_string("FUSION_URI") {
        settings.uri = v;
    }
    if let Some(v) = read_env_u64("FUSION_WAIT_MS", 0, 600_000) {
        settings.options.wait_ms = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
