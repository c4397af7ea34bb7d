//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on values that do not parse.
//! Everything has a default, so an empty environment is valid.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::controller::ControllerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub controller: ControllerConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = ControllerConfig::default();
        let config = Self {
            controller: ControllerConfig {
                name: var_or("RECONQ_NAME", defaults.name),
                parent_kind: var_or("RECONQ_PARENT_KIND", defaults.parent_kind),
                dependent_kind: var_or("RECONQ_DEPENDENT_KIND", defaults.dependent_kind),
                workers: parsed_var("RECONQ_WORKERS")?.unwrap_or(defaults.workers),
                sync_timeout: parsed_var("RECONQ_SYNC_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.sync_timeout),
                backoff_base: parsed_var("RECONQ_BACKOFF_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff_base),
                backoff_max: parsed_var("RECONQ_BACKOFF_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff_max),
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// ```toml
    /// log_level = "debug"
    ///
    /// [controller]
    /// name = "gateway-shim"
    /// parent_kind = "Gateway"
    /// workers = 2
    /// backoff_base_ms = 500
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if c.backoff_max < c.backoff_base {
            return Err(Error::Config(format!(
                "backoff max ({:?}) is below backoff base ({:?})",
                c.backoff_max, c.backoff_base
            )));
        }
        if c.parent_kind.is_empty() || c.dependent_kind.is_empty() {
            return Err(Error::Config("resource kinds must not be empty".to_string()));
        }
        Ok(())
    }
}

fn var_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    controller: FileControllerConfig,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileControllerConfig {
    name: Option<String>,
    parent_kind: Option<String>,
    dependent_kind: Option<String>,
    workers: Option<usize>,
    sync_timeout_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
}

impl FileConfig {
    fn into_config(self) -> Config {
        let d = ControllerConfig::default();
        let c = self.controller;
        Config {
            controller: ControllerConfig {
                name: c.name.unwrap_or(d.name),
                parent_kind: c.parent_kind.unwrap_or(d.parent_kind),
                dependent_kind: c.dependent_kind.unwrap_or(d.dependent_kind),
                workers: c.workers.unwrap_or(d.workers),
                sync_timeout: c
                    .sync_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.sync_timeout),
                backoff_base: c
                    .backoff_base_ms
                    .map(Duration::from_millis)
                    .unwrap_or(d.backoff_base),
                backoff_max: c
                    .backoff_max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(d.backoff_max),
            },
            otel_endpoint: self.otel_endpoint,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        }
    }
}
