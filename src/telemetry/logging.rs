//! Logging configuration and initialization.
//!
//! The `[logging]` section of config.toml picks the level and output
//! format. `RUST_LOG`, when set, overrides the level.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration from config.toml.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `level` names a tracing level.
    pub fn has_known_level(&self) -> bool {
        parse_level(&self.level).is_some()
    }
}

/// Initializes the logging system.
///
/// Priority:
/// 1. RUST_LOG environment variable (if set)
/// 2. config parameter (if provided)
/// 3. Default: info level, pretty format
///
/// A second call is a no-op, so the CLI can initialize early and the
/// daemon again once its config is loaded without failing.
pub fn init_logging(config: Option<&LogConfig>) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if let Some(cfg) = config {
        let level = parse_level(&cfg.level).unwrap_or(Level::INFO);
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::new("info")
    };

    let format = config.map(|c| c.format).unwrap_or_default();

    match format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            );
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::new();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.has_known_level());
    }

    #[test]
    fn test_log_config_from_toml() {
        let config: LogConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
    }
}
