//! Layered server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `HUDDLE_*` environment overrides (highest priority)
//!
//! Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const DEV_TOKEN_SECRET: &str = "huddle-dev-secret-change-me";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HuddleSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub rooms: RoomSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Frames buffered per connection before sends start failing.
    pub send_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8001,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/huddle.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomSettings {
    pub default_max_users: u32,
    pub max_users_limit: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            default_max_users: 8,
            max_users_limit: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSettings {
    #[serde(skip_serializing)]
    pub token_secret: SecretString,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_secret: SecretString::from(DEV_TOKEN_SECRET),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `compact`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
        }
    }
}

impl HuddleSettings {
    /// Load from an optional file path with env var overrides.
    ///
    /// A missing file yields defaults; invalid JSON is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let defaults = serde_json::to_value(HuddleSettings::default())?;

        let merged = match path {
            Some(path) if path.exists() => {
                debug!(?path, "loading settings from file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                deep_merge(defaults, user)
            }
            Some(path) => {
                debug!(?path, "settings file not found, using defaults");
                defaults
            }
            None => defaults,
        };

        let mut settings: HuddleSettings = serde_json::from_value(merged)?;
        apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue("sendQueueCapacity must be > 0".into()));
        }
        if self.rooms.default_max_users == 0 {
            return Err(SettingsError::InvalidValue("defaultMaxUsers must be > 0".into()));
        }
        if self.rooms.default_max_users > self.rooms.max_users_limit {
            return Err(SettingsError::InvalidValue(format!(
                "defaultMaxUsers {} exceeds maxUsersLimit {}",
                self.rooms.default_max_users, self.rooms.max_users_limit
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced by `source`,
/// and nulls in `source` keep the target value.
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

/// Apply `HUDDLE_*` environment overrides. Invalid values are ignored with a
/// warning.
pub fn apply_env_overrides(settings: &mut HuddleSettings) {
    if let Some(v) = read_env_string("HUDDLE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("HUDDLE_PORT", 0, 65535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = read_env_u64("HUDDLE_SEND_QUEUE", 1, 65_536) {
        settings.server.send_queue_capacity = v as usize;
    }
    if let Some(v) = read_env_u64("HUDDLE_HEARTBEAT_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_string("HUDDLE_DB_PATH") {
        settings.storage.database_path = PathBuf::from(v);
    }
    if let Some(v) = read_env_u64("HUDDLE_DEFAULT_MAX_USERS", 1, 1000) {
        settings.rooms.default_max_users = v as u32;
    }
    if let Some(v) = read_env_string("HUDDLE_TOKEN_SECRET") {
        settings.auth.token_secret = SecretString::from(v);
    }
    if let Some(v) = read_env_string("HUDDLE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("HUDDLE_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}
