//! Log subscriber for host processes
//!
//! The library only emits `tracing` events. A binary that embeds it calls
//! [`init_telemetry`] once at startup.

use std::str::FromStr;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVICE: &str = "atomic-readmodel";
const DEFAULT_FILTER: &str = "info";

/// Output shape of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human readable output
    Compact,
    /// One JSON object per event, with source locations
    Json,
    /// Filter installed, nothing printed
    Off,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            "off" | "none" => Ok(LogFormat::Off),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE.to_string(),
            format: LogFormat::Compact,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `SERVICE_NAME`, `LOG_FORMAT` (or the `LOG_JSON` / `LOG_CONSOLE`
    /// switches) and `LOG_LEVEL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let is = |key: &str, values: [&str; 2]| {
            var(key).is_some_and(|v| values.contains(&v.as_str()))
        };

        let format = match var("LOG_FORMAT").and_then(|v| v.parse().ok()) {
            Some(format) => format,
            None if is("LOG_CONSOLE", ["false", "0"]) => LogFormat::Off,
            None if is("LOG_JSON", ["true", "1"]) => LogFormat::Json,
            None => LogFormat::Compact,
        };

        Self {
            service_name: var("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
            format,
            filter: var("LOG_LEVEL").unwrap_or_else(|| DEFAULT_FILTER.to_string()),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global subscriber. Fails when one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    match config.format {
        LogFormat::Off => registry.try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init()?,
    }

    tracing::info!(service = %config.service_name, format = ?config.format, "Logging initialized");
    Ok(())
}
