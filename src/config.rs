//! Configuration loading with figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (default `config/acquire.toml`; a missing file is ignored)
//! 3. environment variables prefixed with `ACQ_`, sections separated by a
//!    double underscore, e.g. `ACQ_ACQUISITION__BUFFER_COUNT=8`
//!
//! Durations use humantime syntax (`"500ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use acq_stream::config::AcqConfig;
//!
//! let config = AcqConfig::load()?;
//! config.validate().map_err(acq_stream::AcqError::Configuration)?;
//! println!("buffers: {}", config.acquisition.buffer_count);
//! # Ok::<(), acq_stream::AcqError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::LoopConfig;
use crate::device::ConnectionId;
use crate::error::Result;
use crate::logging::{parse_log_level, OutputFormat};
use crate::pool::DEFAULT_BUFFER_COUNT;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/acquire.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ACQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcqConfig {
    /// `[acquisition]`
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// `[device]`
    #[serde(default)]
    pub device: DeviceSettings,
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Buffer pool and loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Buffers requested from the stream (capped by its queue capacity).
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Bounded wait for one retrieval.
    #[serde(default = "default_retrieve_timeout", with = "humantime_serde")]
    pub retrieve_timeout: Duration,
    /// Pause between `AcquisitionStart` and the first retrieval.
    #[serde(default, with = "humantime_serde")]
    pub start_delay: Duration,
    /// Stop after this many iterations; unbounded when absent.
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

/// Device selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Connection id to use; the first usable device when absent.
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_buffer_count() -> usize {
    DEFAULT_BUFFER_COUNT
}

fn default_retrieve_timeout() -> Duration {
    crate::acquisition::DEFAULT_RETRIEVE_TIMEOUT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            retrieve_timeout: default_retrieve_timeout(),
            start_delay: Duration::ZERO,
            max_iterations: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

impl AcqConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by [`AcqConfig::load_from`].
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check values figment cannot check by type alone.
    pub fn validate(&self) -> std::result::Result<(), String> {
        parse_log_level(&self.logging.level)?;

        if self.acquisition.buffer_count == 0 {
            return Err("acquisition.buffer_count must be at least 1".to_string());
        }
        if self.acquisition.retrieve_timeout.is_zero() {
            return Err("acquisition.retrieve_timeout must be greater than zero".to_string());
        }
        if self.acquisition.max_iterations == Some(0) {
            return Err("acquisition.max_iterations must be at least 1 when set".to_string());
        }
        if let Some(id) = &self.device.connection_id {
            if id.trim().is_empty() {
                return Err("device.connection_id must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Loop parameters derived from `[acquisition]`.
    #[must_use]
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            retrieve_timeout: self.acquisition.retrieve_timeout,
            max_iterations: self.acquisition.max_iterations,
        }
    }

    /// Configured connection id, if any.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.device.connection_id.clone().map(ConnectionId::from)
    }
}
