//! Logging setup
//!
//! One `tracing-subscriber` registry with an `EnvFilter` and a single `fmt`
//! layer. Without `RUST_LOG` the configured level applies to this crate and
//! everything else is held at `warn`. Thread names are on by default so
//! records from the `scan-worker-N` threads are easy to tell apart from the
//! supervisor.
//!
//! # Example
//! ```no_run
//! use beamline_scan::{config::AppConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(device = "m1", "scan started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Record layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per record
    Compact,
    /// One JSON object per record
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "unknown log format '{other}' (expected pretty, compact or json)"
            )),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for this crate when `RUST_LOG` is unset
    pub level: Level,
    /// Record layout
    pub format: OutputFormat,
    /// Emit enter/close events for spans such as the worker's `command` span
    pub with_span_events: bool,
    /// Source file and line on every record
    pub with_file_and_line: bool,
    /// Thread name on every record
    pub with_thread_names: bool,
    /// Colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options from the `[application]` section
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Default options at `level`
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the record layout
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Filter used when `RUST_LOG` is unset
    fn default_directives(&self) -> String {
        format!(
            "warn,{}={}",
            env!("CARGO_CRATE_NAME"),
            self.level.as_str().to_ascii_lowercase()
        )
    }
}

/// Install the global subscriber described by `[application]`
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(LoggingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// A no-op returning `Ok(())` when a subscriber is already installed, so
/// tests and the CLI can both call it.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Lost a race with another initializer.
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(format!("failed to install tracing subscriber: {e}")),
    }
}

fn parse_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!("unknown log level '{level}' (expected trace, debug, info, warn or error)")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_and_formats_parse_case_insensitively() {
        assert_eq!(parse_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_level("WARN"), Ok(Level::WARN));
        assert!(parse_level("loud").is_err());

        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_from_app_config() {
        let mut config = AppConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = "pretty".to_string();

        let logging = LoggingConfig::from_app_config(&config).unwrap();
        assert_eq!(logging.level, Level::DEBUG);
        assert_eq!(logging.format, OutputFormat::Pretty);
        assert!(logging.with_thread_names);
    }

    #[test]
    fn test_default_directives_scope_level_to_crate() {
        let config = LoggingConfig::new(Level::TRACE).with_format(OutputFormat::Json);
        assert_eq!(config.default_directives(), "warn,beamline_scan=trace");
    }
}
