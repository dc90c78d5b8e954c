//! Layered settings.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleSettings::default()`]
//! 2. Deep-merge the JSON settings file over the defaults, if there is one
//! 3. Apply `HUDDLE_*` environment overrides (highest priority)
//!
//! CLI flags are applied by the binary after loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use huddle_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Level;

use crate::error::ConfigError;

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Upgrades beyond this many live sockets are refused with 503.
    pub max_connections: usize,
    /// Outbound events buffered per client before new ones are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// Close the socket after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    pub max_message_size: usize,
    /// Capacity of the presence actor's inbox.
    pub command_queue: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3001,
            max_connections: 1000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            command_queue: 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging and metrics settings, as written in the settings file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// Module path → level, e.g. `{"huddle_presence": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    pub log_to_sqlite: bool,
    pub log_db_path: Option<PathBuf>,
    pub metrics_enabled: bool,
    pub metrics_db_path: Option<PathBuf>,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        let defaults = TelemetryConfig::default();
        Self {
            log_level: "info".into(),
            module_levels: BTreeMap::new(),
            log_to_sqlite: defaults.log_to_sqlite,
            log_db_path: None,
            metrics_enabled: defaults.metrics_enabled,
            metrics_db_path: None,
            metrics_snapshot_interval_secs: defaults.metrics_snapshot_interval_secs,
            metrics_retention_days: defaults.metrics_retention_days,
        }
    }
}

impl TelemetrySettings {
    pub fn to_telemetry_config(&self) -> Result<TelemetryConfig, ConfigError> {
        let defaults = TelemetryConfig::default();
        let module_levels = self
            .module_levels
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(TelemetryConfig {
            log_level: parse_level(&self.log_level)?,
            module_levels,
            log_to_sqlite: self.log_to_sqlite,
            log_db_path: self.log_db_path.clone().unwrap_or(defaults.log_db_path),
            metrics_enabled: self.metrics_enabled,
            metrics_db_path: self.metrics_db_path.clone().unwrap_or(defaults.metrics_db_path),
            metrics_snapshot_interval_secs: self.metrics_snapshot_interval_secs,
            metrics_retention_days: self.metrics_retention_days,
        })
    }
}

/// Everything the binary needs to boot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleSettings {
    pub server: ServerConfig,
    pub telemetry: TelemetrySettings,
}

impl HuddleSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "server.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "server.heartbeat_timeout_secs ({}) is shorter than the interval ({})",
                server.heartbeat_timeout_secs, server.heartbeat_interval_secs
            )));
        }
        for (name, value) in [
            ("server.max_connections", server.max_connections),
            ("server.max_send_queue", server.max_send_queue),
            ("server.command_queue", server.command_queue),
            ("server.max_message_size", server.max_message_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{name} must be positive")));
            }
        }
        if self.telemetry.metrics_enabled && self.telemetry.metrics_snapshot_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "telemetry.metrics_snapshot_interval_secs must be positive".into(),
            ));
        }
        self.telemetry.to_telemetry_config().map(|_| ())
    }
}

fn parse_level(raw: &str) -> Result<Level, ConfigError> {
    Level::from_str(raw).map_err(|_| ConfigError::InvalidValue(format!("unknown log level: {raw}")))
}

/// `~/.huddle/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".huddle").join("settings.json")
}

/// Load from the default path. A missing file means defaults.
pub fn load_settings() -> Result<HuddleSettings, ConfigError> {
    load(&settings_path(), false, |key| std::env::var(key).ok())
}

/// Load from an explicit path. A missing file is an error.
pub fn load_settings_from_file(path: &Path) -> Result<HuddleSettings, ConfigError> {
    load(path, true, |key| std::env::var(key).ok())
}

fn load(
    path: &Path,
    required: bool,
    env: impl Fn(&str) -> Option<String>,
) -> Result<HuddleSettings, ConfigError> {
    let defaults = serde_json::to_value(HuddleSettings::default())?;

    let merged = if path.exists() {
        tracing::debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else if required {
        return Err(ConfigError::Missing(path.to_path_buf()));
    } else {
        defaults
    };

    let mut settings: HuddleSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    Ok(settings)
}

/// Objects merge per key; everything else in `source` replaces `target`.
/// Nulls in `source` keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HUDDLE_*` overrides read through `env`. Unparseable values are
/// ignored.
pub fn apply_env_overrides(settings: &mut HuddleSettings, env: impl Fn(&str) -> Option<String>) {
    let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(v) = env("HUDDLE_HOST").filter(|v| !v.is_empty()) {
        settings.server.host = v;
    }
    if let Some(v) = parsed("HUDDLE_PORT").and_then(|v| u16::try_from(v).ok()) {
        settings.server.port = v;
    }
    if let Some(v) = parsed("HUDDLE_MAX_CONNECTIONS").filter(|v| *v > 0) {
        settings.server.max_connections = v as usize;
    }
    if let Some(v) = parsed("HUDDLE_HEARTBEAT_INTERVAL_SECS").filter(|v| *v > 0) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = parsed("HUDDLE_HEARTBEAT_TIMEOUT_SECS").filter(|v| *v > 0) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env("HUDDLE_LOG_LEVEL").filter(|v| Level::from_str(v).is_ok()) {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = env("HUDDLE_LOG_TO_SQLITE").and_then(|v| parse_bool(&v)) {
        settings.telemetry.log_to_sqlite = v;
    }
    if let Some(v) = env("HUDDLE_METRICS_ENABLED").and_then(|v| parse_bool(&v)) {
        settings.telemetry.metrics_enabled = v;
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let settings = HuddleSettings::default();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 3001);
        assert_eq!(settings.server.max_send_queue, 256);
        assert_eq!(settings.server.heartbeat_interval_secs, 30);
        assert_eq!(settings.server.heartbeat_timeout_secs, 90);
        assert_eq!(settings.telemetry.log_level, "info");
        settings.validate().unwrap();
    }

    #[test]
    fn missing_optional_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load(&dir.path().join("absent.json"), false, no_env).unwrap();
        assert_eq!(settings.server.port, 3001);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.json"), true, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 4000}, "telemetry": {"module_levels": {"huddle_presence": "debug"}}}"#,
        )
        .unwrap();

        let settings = load(&path, true, no_env).unwrap();
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.max_connections, 1000);
        let telemetry = settings.telemetry.to_telemetry_config().unwrap();
        assert_eq!(
            telemetry.module_levels,
            vec![("huddle_presence".to_string(), Level::DEBUG)]
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load(&path, true, no_env), Err(ConfigError::Json(_))));
    }

    #[test]
    fn env_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 4000}}"#).unwrap();

        let env = env_of(&[
            ("HUDDLE_PORT", "5000"),
            ("HUDDLE_HOST", "0.0.0.0"),
            ("HUDDLE_LOG_TO_SQLITE", "off"),
            ("HUDDLE_LOG_LEVEL", "debug"),
        ]);
        let settings = load(&path, true, env).unwrap();
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert!(!settings.telemetry.log_to_sqlite);
        assert_eq!(settings.telemetry.log_level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = HuddleSettings::default();
        apply_env_overrides(
            &mut settings,
            env_of(&[
                ("HUDDLE_PORT", "99999"),
                ("HUDDLE_MAX_CONNECTIONS", "lots"),
                ("HUDDLE_LOG_LEVEL", "chatty"),
                ("HUDDLE_METRICS_ENABLED", "maybe"),
            ]),
        );
        assert_eq!(settings.server.port, 3001);
        assert_eq!(settings.server.max_connections, 1000);
        assert_eq!(settings.telemetry.log_level, "info");
        assert!(settings.telemetry.metrics_enabled);
    }

    #[test]
    fn deep_merge_rules() {
        let target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2], "keep": true});
        let source = json!({"a": {"c": 3}, "list": [9], "keep": null, "new": "x"});
        let merged = deep_merge(target, source);
        assert_eq!(
            merged,
            json!({"a": {"b": 1, "c": 3}, "list": [9], "keep": true, "new": "x"})
        );
    }

    #[test]
    fn validate_rejects_timeout_shorter_than_interval() {
        let mut settings = HuddleSettings::default();
        settings.server.heartbeat_interval_secs = 30;
        settings.server.heartbeat_timeout_secs = 10;
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_queues() {
        let mut settings = HuddleSettings::default();
        settings.server.max_send_queue = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("max_send_queue"));
    }

    #[test]
    fn validate_rejects_unknown_log_level() {
        let mut settings = HuddleSettings::default();
        settings.telemetry.log_level = "loud".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn telemetry_paths_fall_back_to_defaults() {
        let settings = TelemetrySettings::default();
        let config = settings.to_telemetry_config().unwrap();
        assert_eq!(config.log_db_path, TelemetryConfig::default().log_db_path);

        let custom = TelemetrySettings {
            log_db_path: Some(PathBuf::from("/var/lib/huddle/logs.db")),
            ..TelemetrySettings::default()
        };
        let config = custom.to_telemetry_config().unwrap();
        assert_eq!(config.log_db_path, PathBuf::from("/var/lib/huddle/logs.db"));
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = ServerConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }
}
