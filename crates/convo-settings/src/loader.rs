//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncSettings::default()`]
//! 2. If `~/.convo/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CONVO_*` environment variable overrides (highest priority)
//! 4. [`SyncSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::SyncSettings;

/// Resolve the path to the settings file (`~/.convo/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".convo").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SyncSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate();
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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

/// Apply `CONVO_*` environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut SyncSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = string("CONVO_WS_URL") {
        settings.connection.url = v;
    }
    if let Some(v) = string("CONVO_BUSINESS_ID") {
        settings.connection.business_id = v;
    }
    if let Some(v) = string("CONVO_AUTH_MODE") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(mode) => settings.connection.auth_mode = mode,
            Err(_) => tracing::warn!(key = "CONVO_AUTH_MODE", value = %v, "unknown auth mode, ignoring"),
        }
    }
    if let Some(v) = number("CONVO_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.connection.handshake_timeout_ms = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = number("CONVO_RECONNECT_BASE_MS", 1, 600_000) {
        settings.reconnect.base_delay_ms = v;
    }
    if let Some(v) = number("CONVO_RECONNECT_MAX_MS", 1, 3_600_000) {
        settings.reconnect.max_delay_ms = v;
    }
    if let Some(v) = number("CONVO_RECONNECT_MAX_ATTEMPTS", 0, 1_000) {
        settings.reconnect.max_attempts = v as u32;
    }

    // ── Dedup ───────────────────────────────────────────────────────
    if let Some(v) = number("CONVO_DEDUP_RETENTION_MS", 1_000, 86_400_000) {
        settings.dedup.retention_ms = v;
    }

    // ── API ─────────────────────────────────────────────────────────
    if let Some(v) = string("CONVO_API_URL") {
        settings.api.base_url = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("CONVO_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = lookup("CONVO_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => tracing::warn!(key = "CONVO_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
