//! Structured logging for the cubeq server
//!
//! Features:
//! - Structured JSON logging for production
//! - Human-readable console logging for development
//! - File rotation with daily log files
//! - Configurable log levels per module

use thiserror::Error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE: &str = "cubeq-server.log";

/// Crates whose chatter is capped at `warn`
const QUIET: &[&str] = &["hyper=warn", "tokio=warn", "runtime=warn", "tower=warn", "h2=warn", "reqwest=warn"];

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter {0:?}: {1}")]
    Filter(String, tracing_subscriber::filter::ParseError),

    #[error("Cannot create log directory {0}: {1}")]
    Directory(String, std::io::Error),

    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production (structured logging)
    Json,
    /// Compact format for testing
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stdout only
    Stdout,
    /// Log to file only
    File,
    /// Log to both stdout and file
    Both,
}

impl LogOutput {
    pub fn parse(s: &str) -> Self {
        match s {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }
}

/// Env filter for `level`, with noisy third-party crates held at `warn`
pub fn filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let mut filter = EnvFilter::try_new(level).map_err(|e| LoggingError::Filter(level.to_string(), e))?;
    for directive in QUIET {
        let directive = directive
            .parse()
            .map_err(|e| LoggingError::Filter(directive.to_string(), e))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Initialize the global subscriber from the logging section of the config
///
/// The config already carries `RUST_LOG`, `LOG_FORMAT`, `LOG_OUTPUT` and
/// `LOG_DIR` overrides, so:
/// ```bash
/// # Production: JSON to file with info level
/// RUST_LOG=info LOG_FORMAT=json LOG_OUTPUT=file LOG_DIR=/var/log/cubeq cubeq-server
///
/// # Debugging the backend translation only
/// RUST_LOG=cubeq_es=debug LOG_FORMAT=compact cubeq-server
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);
    let env_filter = filter(&config.level)?;

    let stdout_layer = match format {
        LogFormat::Pretty => fmt::layer().pretty().with_thread_ids(true).with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    match output {
        LogOutput::Stdout => tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .try_init()?,
        LogOutput::File => tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer(&config.directory)?)
            .try_init()?,
        LogOutput::Both => tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .with(file_layer(&config.directory)?)
            .try_init()?,
    }

    tracing::info!(format = ?format, output = ?output, level = %config.level, "Logging system initialized");
    if output != LogOutput::Stdout {
        tracing::debug!(directory = %config.directory, "Writing daily log files");
    }
    Ok(())
}

fn file_layer<S>(directory: &str) -> Result<Box<dyn Layer<S> + Send + Sync>, LoggingError>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    std::fs::create_dir_all(directory).map_err(|e| LoggingError::Directory(directory.to_string(), e))?;
    let appender = RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE);
    Ok(fmt::layer().with_writer(appender).with_ansi(false).boxed())
}

/// Helper macro for logging with structured fields
///
/// Usage:
/// ```ignore
/// log_event!(
///     level: tracing::Level::INFO,
///     event: "query_served",
///     request_id: id,
///     duration_ms: 42
/// );
/// ```
#[macro_export]
macro_rules! log_event {
    (level: $level:expr, event: $event:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::event!(
            $level,
            event = $event
            $(, $key = ?$value)*
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("fancy"), LogFormat::Pretty);
    }

    #[test]
    fn test_log_output_parse() {
        assert_eq!(LogOutput::parse("file"), LogOutput::File);
        assert_eq!(LogOutput::parse("both"), LogOutput::Both);
        assert_eq!(LogOutput::parse("stdout"), LogOutput::Stdout);
        assert_eq!(LogOutput::parse(""), LogOutput::Stdout);
    }

    #[test]
    fn test_filter_accepts_module_levels() {
        assert!(filter("info").is_ok());
        assert!(filter("cubeq_es=debug,cubeq_engine=trace").is_ok());
        assert!(matches!(filter("cubeq_es=loud"), Err(LoggingError::Filter(..))));
    }
}
