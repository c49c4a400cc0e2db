//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and then overridden by
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::guard::{RateLimitConfig, RetryPreset};

pub const ENV_MAX_REQUESTS: &str = "APIGUARD_MAX_REQUESTS";
pub const ENV_WINDOW_MS: &str = "APIGUARD_WINDOW_MS";
pub const ENV_MAX_QUEUE_SIZE: &str = "APIGUARD_MAX_QUEUE_SIZE";
pub const ENV_RETRY_PRESET: &str = "APIGUARD_RETRY_PRESET";

/// Global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Admission limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry preset, or a full custom policy.
    #[serde(default)]
    pub retry: RetryPreset,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Read a JSON config file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load from an optional file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_REQUESTS) {
            self.rate_limit.max_requests = parse_number(ENV_MAX_REQUESTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WINDOW_MS) {
            self.rate_limit.window = Duration::from_millis(parse_number(ENV_WINDOW_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_MAX_QUEUE_SIZE) {
            self.rate_limit.max_queue_size = match raw.trim() {
                "" | "none" | "unbounded" => None,
                value => Some(parse_number(ENV_MAX_QUEUE_SIZE, value)?),
            };
        }
        if let Some(raw) = lookup(ENV_RETRY_PRESET) {
            self.retry = RetryPreset::from_name(&raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        self.retry.clone().into_config().validate()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::validation(format!("{key}: invalid number {raw:?}")))
}
