//! Client settings with layered sources.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.roomchat/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `ROOMCHAT_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reconnect backoff for the socket driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay applied as +/- jitter.
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
        }
    }
}

/// Everything the client needs to reach the backend and the socket server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientSettings {
    /// Base URL of the REST backend (`/api/room/...` is appended).
    pub backend_url: String,
    /// WebSocket endpoint of the event server.
    pub socket_url: String,
    /// Quiet period after the last keystroke before `stopTyping` is sent.
    pub typing_debounce_ms: u64,
    pub reconnect: ReconnectSettings,
    /// Outbound frames buffered per connection before emits are dropped.
    pub send_queue_capacity: usize,
    pub request_timeout_secs: u64,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:5000".into(),
            socket_url: "ws://localhost:5000/ws".into(),
            typing_debounce_ms: 1000,
            reconnect: ReconnectSettings::default(),
            send_queue_capacity: 256,
            request_timeout_secs: 30,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl ClientSettings {
    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `~/.roomchat`, home of the settings and session files.
pub fn roomchat_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".roomchat")
}

/// Resolve the path to the settings file (`~/.roomchat/settings.json`).
pub fn settings_path() -> PathBuf {
    roomchat_dir().join("settings.json")
}

/// An env override that was ignored because its value did not parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedOverride {
    pub key: &'static str,
    pub value: String,
}

/// Loaded settings, plus the rejected overrides so they can be logged once
/// telemetry (itself configured from these settings) is running.
#[derive(Clone, Debug)]
pub struct LoadedSettings {
    pub settings: ClientSettings,
    pub rejected: Vec<RejectedOverride>,
}

impl LoadedSettings {
    pub fn log_rejected(&self) {
        for r in &self.rejected {
            tracing::warn!(key = r.key, value = %r.value, "invalid env var, ignoring");
        }
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LoadedSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoadedSettings, SettingsError> {
    let mut settings = read_settings_file(path)?;
    let rejected = apply_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(LoadedSettings { settings, rejected })
}

fn read_settings_file(path: &Path) -> Result<ClientSettings, SettingsError> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, everything else is replaced by `source`, and
/// nulls in `source` keep the target value.
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

/// Apply `ROOMCHAT_*` overrides read through `lookup`.
///
/// Invalid values are skipped and returned.
pub fn apply_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<RejectedOverride> {
    let rejected = std::cell::RefCell::new(Vec::new());
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |key: &'static str, min: u64, max: u64| {
        let val = lookup(key)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            rejected.borrow_mut().push(RejectedOverride { key, value: val });
        }
        parsed
    };

    if let Some(v) = string("ROOMCHAT_BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = string("ROOMCHAT_SOCKET_URL") {
        settings.socket_url = v;
    }
    if let Some(v) = number("ROOMCHAT_TYPING_DEBOUNCE_MS", 50, 60_000) {
        settings.typing_debounce_ms = v;
    }
    if let Some(v) = number("ROOMCHAT_RECONNECT_BASE_MS", 10, 60_000) {
        settings.reconnect.base_delay_ms = v;
    }
    if let Some(v) = number("ROOMCHAT_RECONNECT_MAX_MS", 10, 600_000) {
        settings.reconnect.max_delay_ms = v;
    }
    if let Some(v) = number("ROOMCHAT_SEND_QUEUE", 1, 65_536) {
        settings.send_queue_capacity = v as usize;
    }
    if let Some(v) = number("ROOMCHAT_REQUEST_TIMEOUT_SECS", 1, 600) {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = string("ROOMCHAT_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(val) = lookup("ROOMCHAT_LOG_JSON") {
        match parse_bool(&val) {
            Some(v) => settings.log_json = v,
            None => rejected.borrow_mut().push(RejectedOverride {
                key: "ROOMCHAT_LOG_JSON",
                value: val,
            }),
        }
    }
    rejected.into_inner()
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = ClientSettings::default();
        assert_eq!(s.typing_debounce(), Duration::from_millis(1000));
        assert_eq!(s.send_queue_capacity, 256);
        assert_eq!(s.reconnect.base_delay_ms, 500);
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            serde_json::json!({"reconnect": {"baseDelayMs": 500, "maxDelayMs": 10000}}),
            serde_json::json!({"reconnect": {"maxDelayMs": 2000}}),
        );
        assert_eq!(merged["reconnect"]["baseDelayMs"], 500);
        assert_eq!(merged["reconnect"]["maxDelayMs"], 2000);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_settings_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"backendUrl": "https://chat.example.com", "reconnect": {"maxDelayMs": 3000}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.backend_url, "https://chat.example.com");
        assert_eq!(settings.reconnect.max_delay_ms, 3000);
        assert_eq!(settings.reconnect.base_delay_ms, 500);
        assert_eq!(settings.typing_debounce_ms, 1000);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(read_settings_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = ClientSettings::default();
        let rejected = apply_overrides(
            &mut settings,
            lookup_from(&[
                ("ROOMCHAT_BACKEND_URL", "http://api.local"),
                ("ROOMCHAT_TYPING_DEBOUNCE_MS", "750"),
                ("ROOMCHAT_SEND_QUEUE", "16"),
                ("ROOMCHAT_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.backend_url, "http://api.local");
        assert_eq!(settings.typing_debounce_ms, 750);
        assert_eq!(settings.send_queue_capacity, 16);
        assert!(settings.log_json);
        assert!(rejected.is_empty());
    }

    #[test]
    fn invalid_env_values_are_ignored_and_reported() {
        let mut settings = ClientSettings::default();
        let rejected = apply_overrides(
            &mut settings,
            lookup_from(&[
                ("ROOMCHAT_TYPING_DEBOUNCE_MS", "fast"),
                ("ROOMCHAT_SEND_QUEUE", "0"),
                ("ROOMCHAT_LOG_JSON", "maybe"),
                ("ROOMCHAT_SOCKET_URL", ""),
            ]),
        );
        assert_eq!(settings, ClientSettings::default());
        let keys: Vec<_> = rejected.iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec!["ROOMCHAT_TYPING_DEBOUNCE_MS", "ROOMCHAT_SEND_QUEUE", "ROOMCHAT_LOG_JSON"]
        );
        assert_eq!(rejected[0].value, "fast");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
        assert_eq!(parse_u64_range("10", 1, 100), Some(10));
        assert_eq!(parse_u64_range("1000", 1, 100), None);
    }
}
