//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. Environment variables (prefixed with BEAMSCAN_, nested keys split on `__`)
//!
//! Every section has defaults, so `AppConfig::default()` is a complete,
//! valid configuration that drives the simulated device database.
//!
//! # Example
//! ```no_run
//! use beamline_scan::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/beamline.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::hardware::registry::DeviceDefinition;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Wait-point polling and trigger timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Supervisor polling and recovery settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Scan log / results output
    #[serde(default)]
    pub output: OutputConfig,
    /// Simulated devices served when no database file is given
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Polling intervals and pulse-generator timing used by the trigger synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between busy polls at every worker wait point
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Added to the dwell time to form the detector frame period
    #[serde(default = "default_period_epsilon")]
    pub period_epsilon: f64,
    /// Four-channel burst timing offsets
    #[serde(default)]
    pub burst: BurstTiming,
}

/// Empirically tuned offsets for the four pulse-generator channels.
///
/// These are configuration values. Identical channel timings make the
/// generator miss triggers, so the delays must stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurstTiming {
    /// Width of the calibration pulse on channel A
    #[serde(default = "default_calibration_width")]
    pub calibration_width: f64,
    /// Delay of the detector exposure pulse on channel B
    #[serde(default = "default_exposure_delay")]
    pub exposure_delay: f64,
    /// Delay of the counting window pulse on channel C
    #[serde(default = "default_counting_delay")]
    pub counting_delay: f64,
    /// Offset of the desynchronizing pulse on channel D
    #[serde(default = "default_desync_offset")]
    pub desync_offset: f64,
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Period of the result channel poll
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    /// How long ingestion waits for the scan log to appear
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Longest silence on the result channel before a scan is declared failed
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    /// Command channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for scan logs
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    /// Write a scan log and tail it instead of consuming points directly
    #[serde(default)]
    pub file_tail: bool,
}

// Default value functions
fn default_name() -> String {
    "Beamline Scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_period_epsilon() -> f64 {
    1e-4
}

fn default_calibration_width() -> f64 {
    1e-6
}

fn default_exposure_delay() -> f64 {
    2e-6
}

fn default_counting_delay() -> f64 {
    3e-6
}

fn default_desync_offset() -> f64 {
    5e-5
}

fn default_poll_period_ms() -> u64 {
    10
}

fn default_startup_timeout_ms() -> u64 {
    5000
}

fn default_completion_timeout_ms() -> u64 {
    30_000
}

fn default_channel_capacity() -> usize {
    32
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("scans")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            period_epsilon: default_period_epsilon(),
            burst: BurstTiming::default(),
        }
    }
}

impl Default for BurstTiming {
    fn default() -> Self {
        Self {
            calibration_width: default_calibration_width(),
            exposure_delay: default_exposure_delay(),
            counting_delay: default_counting_delay(),
            desync_offset: default_desync_offset(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: default_poll_period_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            file_tail: false,
        }
    }
}

impl TimingConfig {
    /// Busy-poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SupervisorConfig {
    /// Result channel poll period
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Ingestion startup timeout
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Result channel silence limit
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from defaults and environment variables only
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables can override configuration with prefix BEAMSCAN_
    /// Example: BEAMSCAN_APPLICATION__LOG_LEVEL=debug
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMSCAN_").split("__"))
            .extract()
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Env::prefixed("BEAMSCAN_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.timing.poll_interval_ms == 0 {
            return Err("timing.poll_interval_ms must be positive".to_string());
        }
        if !(self.timing.period_epsilon > 0.0) {
            return Err("timing.period_epsilon must be positive".to_string());
        }
        if self.supervisor.poll_period_ms == 0 {
            return Err("supervisor.poll_period_ms must be positive".to_string());
        }
        if self.supervisor.channel_capacity == 0 {
            return Err("supervisor.channel_capacity must be positive".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name()) {
                return Err(format!("Duplicate device name: {}", device.name()));
            }
        }

        Ok(())
    }
}
