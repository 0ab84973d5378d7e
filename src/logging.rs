//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary (or to tests). Events use structured fields, for example
//! `device`, `buffer`, `block_id` and `status`, so JSON output can be
//! filtered per device.
//!
//! # Example
//! ```no_run
//! use acq_stream::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! logging::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json))
//!     .expect("tracing init");
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::AcqConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured (interactive use)
    #[default]
    Pretty,
    /// Single-line, no colours
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names (the loop thread is named after its device)
    pub with_thread_names: bool,
    /// ANSI colours for the pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Options for `level` with defaults otherwise.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from the `[logging]` section.
    pub fn from_config(config: &AcqConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            ..Default::default()
        })
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colours.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber described by the `[logging]` section.
pub fn init_from_config(config: &AcqConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. Calling this again after a
/// subscriber is installed is a no-op.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let base = fmt::layer()
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        OutputFormat::Pretty => base
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => base
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
