//! Proxy configuration with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ProxyConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its values over defaults
//! 3. Apply `QUAY_*` environment variable overrides (highest priority)

use std::path::Path;

use quay_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    /// Outbound frames buffered per client stream before writes report busy.
    pub max_send_queue: usize,
    /// Deadline for a whole `SendMessage` call. Expiry still reaches the send hook.
    pub request_timeout_ms: u64,
    /// Deadline for a single legacy send, watchdog included.
    pub send_timeout_ms: u64,
    pub scavenge_interval_ms: u64,
    pub client_idle_timeout_ms: u64,
    pub broker_name: String,
    pub broker_addr: String,
    pub queue_nums: i32,
    /// Qualified topic names the proxy will route. Empty means every topic.
    pub allowed_topics: Vec<String>,
    pub telemetry: TelemetryConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            max_send_queue: 256,
            request_timeout_ms: 30_000,
            send_timeout_ms: 3_000,
            scavenge_interval_ms: 10_000,
            client_idle_timeout_ms: 120_000,
            broker_name: "broker-a".into(),
            broker_addr: "127.0.0.1:10911".into(),
            queue_nums: 8,
            allowed_topics: Vec::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Load config from an optional file path with env var overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    let defaults = serde_json::to_value(ProxyConfig::default())?;
    let merged = match path {
        Some(path) if path.exists() => {
            tracing::debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            tracing::debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ProxyConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Objects merge recursively; arrays and primitives are replaced; nulls are skipped.
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

/// Apply `QUAY_*` overrides read through `lookup`. Out-of-range values are ignored.
pub fn apply_env_overrides<F>(config: &mut ProxyConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("QUAY_HOST") {
        config.host = v;
    }
    if let Some(v) = read_range(&read, "QUAY_PORT", 0u16, u16::MAX) {
        config.port = v;
    }
    if let Some(v) = read_range(&read, "QUAY_MAX_SEND_QUEUE", 1usize, 65_536) {
        config.max_send_queue = v;
    }
    if let Some(v) = read_range(&read, "QUAY_SEND_TIMEOUT_MS", 100u64, 600_000) {
        config.send_timeout_ms = v;
    }
    if let Some(v) = read_range(&read, "QUAY_REQUEST_TIMEOUT_MS", 100u64, 600_000) {
        config.request_timeout_ms = v;
    }
    if let Some(v) = read_range(&read, "QUAY_SCAVENGE_INTERVAL_MS", 100u64, 3_600_000) {
        config.scavenge_interval_ms = v;
    }
    if let Some(v) = read_range(&read, "QUAY_CLIENT_IDLE_TIMEOUT_MS", 1_000u64, 86_400_000) {
        config.client_idle_timeout_ms = v;
    }
    if let Some(v) = read("QUAY_BROKER_NAME") {
        config.broker_name = v;
    }
    if let Some(v) = read("QUAY_BROKER_ADDR") {
        config.broker_addr = v;
    }
    if let Some(v) = read_range(&read, "QUAY_QUEUE_NUMS", 1i32, 1024) {
        config.queue_nums = v;
    }
    if let Some(v) = read("QUAY_ALLOWED_TOPICS") {
        config.allowed_topics = v
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = read("QUAY_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
}

fn read_range<T, R>(read: &R, name: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
    R: Fn(&str) -> Option<String>,
{
    let val = read(name)?;
    let parsed = parse_range(&val, min, max);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env override, ignoring");
    }
    parsed
}

/// Parse `val` and accept it only within `[min, max]`.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
