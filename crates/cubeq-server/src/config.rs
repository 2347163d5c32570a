//! Configuration for the cubeq server
//!
//! Loads configuration from:
//! 1. config.yaml - operational settings (port, backend, logging)
//! 2. .env file - deployment overrides, loaded into the environment
//!
//! Environment variables always override config.yaml values.

use cubeq_es::{EsSettings, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnvVar { var: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Search backend connection and request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://localhost:9200`
    pub url: String,

    /// Per-request timeout
    pub timeout_ms: u64,

    /// Attempts per backend call, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt
    pub initial_backoff_ms: u64,

    pub max_facets: usize,
    pub term_size: usize,
    pub scan_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let settings = EsSettings::default();
        Self {
            url: "http://localhost:9200".to_string(),
            timeout_ms: 30_000,
            max_attempts: settings.retry.max_attempts,
            initial_backoff_ms: settings.retry.initial_delay.as_millis() as u64,
            max_facets: settings.max_facets,
            term_size: settings.term_size,
            scan_size: settings.scan_size,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn es_settings(&self) -> EsSettings {
        EsSettings {
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                initial_delay: Duration::from_millis(self.initial_backoff_ms),
                ..Default::default()
            },
            max_facets: self.max_facets,
            term_size: self.term_size,
            scan_size: self.scan_size,
        }
    }
}

/// In-memory execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Rows scanned between cooperative yields
    pub yield_every: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            yield_every: cubeq_engine::DEFAULT_YIELD_EVERY,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file with environment variable
    /// overrides; a missing file means defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production)
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var: name.to_string(),
                value,
            })
        }

        if let Some(host) = var("CUBEQ_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("CUBEQ_SERVER_PORT") {
            self.server.port = parsed("CUBEQ_SERVER_PORT", port)?;
        }
        if let Some(url) = var("CUBEQ_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(attempts) = var("CUBEQ_MAX_ATTEMPTS") {
            self.backend.max_attempts = parsed("CUBEQ_MAX_ATTEMPTS", attempts)?;
        }

        if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }
}
