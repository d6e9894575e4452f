//! Logging setup for the proxy process.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: String,
    /// Per-module level overrides (e.g. "quay_proxy" => "debug").
    pub module_levels: Vec<(String, String)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    /// Build the filter directive string, validating every level.
    pub fn filter_directives(&self) -> Result<String, TelemetryError> {
        let mut filter = parse_level(&self.log_level)?.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            let level = parse_level(level)?;
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        Ok(filter)
    }
}

fn parse_level(s: &str) -> Result<Level, TelemetryError> {
    s.parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(s.to_string()))
}

/// Handle returned by [`init_telemetry`]; keeps the effective filter around for inspection.
pub struct TelemetryGuard {
    directives: Arc<RwLock<String>>,
}

impl TelemetryGuard {
    /// The filter directives the subscriber was installed with.
    pub fn directives(&self) -> String {
        self.directives.read().clone()
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = config.filter_directives()?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;

    Ok(TelemetryGuard {
        directives: Arc::new(RwLock::new(directives)),
    })
}
