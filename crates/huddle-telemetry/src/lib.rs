use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format for stdout logs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    #[default]
    Json,
    /// Human-readable single-line output.
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" | "pretty" => Ok(Self::Compact),
            other => Err(TelemetryError::InvalidFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown log format: {0}")]
    InvalidFormat(String),

    #[error("subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "huddle_server::router" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

/// Build the filter directive string for a base level plus module overrides.
pub fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let (json_layer, compact_layer) = match config.format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        ),
        LogFormat::Compact => (
            None,
            Some(tracing_subscriber::fmt::layer().compact().with_target(true)),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_without_overrides() {
        assert_eq!(filter_directives(Level::INFO, &[]), "info");
    }

    #[test]
    fn directives_append_module_levels() {
        let overrides = vec![
            ("huddle_server::router".to_string(), Level::DEBUG),
            ("tower_http".to_string(), Level::WARN),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &overrides),
            "info,huddle_server::router=debug,tower_http=warn"
        );
    }

    #[test]
    fn log_format_parses_aliases() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn log_format_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&LogFormat::Compact).unwrap(), "\"compact\"");
        let parsed: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(parsed, LogFormat::Json);
    }
}
