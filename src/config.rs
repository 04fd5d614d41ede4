//! Configuration using Figment
//!
//! Configuration is layered, later sources win:
//! 1. Built-in defaults
//! 2. `config/ppc1.toml` (optional)
//! 3. Environment variables prefixed with `PPC1_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use ppc1_control::config::Ppc1Config;
//!
//! let config = Ppc1Config::load()?;
//! println!("Port: {}", config.serial.port);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::fluidics::{DefaultOperatingPoint, PercentLimits, PipeGeometry, WellConfig};
use crate::hardware::filter::MAX_FILTER_SIZE;
use crate::hardware::serial::DEFAULT_BAUD_RATE;
use crate::hardware::wire::{
    DEFAULT_STREAM_PERIOD_MS, MAX_STREAM_PERIOD_MS, MIN_STREAM_PERIOD_MS,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ppc1.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Ppc1Config {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub serial: SerialConfig,
    /// 100 % droplet-size reference set points
    pub defaults: DefaultOperatingPoint,
    /// Pipe lengths for flow estimates
    pub geometry: PipeGeometry,
    /// Percentage windows
    pub limits: PercentLimits,
    /// Protocol runner settings
    pub runner: RunnerConfig,
    /// Sensor smoothing
    pub filter: FilterConfig,
    /// Well capacities
    pub wells: WellConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path (e.g. "/dev/ttyACM0", "COM3")
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-line read timeout while streaming
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Telemetry period requested when the poller starts
    #[serde(default = "default_stream_period")]
    pub stream_period_ms: u32,
    /// Require the PPC1 USB vendor/product id before opening
    #[serde(default = "default_true")]
    pub verify_identity: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            stream_period_ms: default_stream_period(),
            verify_identity: default_true(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Protocol runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Countdown granularity of wait steps
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    /// Start in simulation mode
    #[serde(default)]
    pub simulation: bool,
    /// Capacity of the runner event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
            simulation: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl RunnerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Moving-average filter on sensor readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_filter_size")]
    pub size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_filter_size(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM1".to_string()
    } else {
        "/dev/ttyACM0".to_string()
    }
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> u64 {
    250
}

fn default_stream_period() -> u32 {
    DEFAULT_STREAM_PERIOD_MS
}

fn default_true() -> bool {
    true
}

fn default_tick() -> u64 {
    100
}

fn default_event_capacity() -> usize {
    1024
}

fn default_filter_size() -> usize {
    10
}

impl Ppc1Config {
    /// Load configuration from `config/ppc1.toml` and environment variables
    ///
    /// Example override: `PPC1_SERIAL__PORT=/dev/ttyACM1`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack, exposed for callers that merge extra sources.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Ppc1Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PPC1_").split("__"))
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

        if self.serial.port.trim().is_empty() {
            return Err("Serial port must not be empty".to_string());
        }

        let period = self.serial.stream_period_ms;
        if !(MIN_STREAM_PERIOD_MS..=MAX_STREAM_PERIOD_MS).contains(&period) {
            return Err(format!(
                "Invalid stream_period_ms {period}. Must be {MIN_STREAM_PERIOD_MS}-{MAX_STREAM_PERIOD_MS}"
            ));
        }

        if self.serial.read_timeout_ms <= u64::from(period) {
            return Err(format!(
                "read_timeout_ms ({}) must exceed stream_period_ms ({period})",
                self.serial.read_timeout_ms
            ));
        }

        if self.runner.tick_ms == 0 || self.runner.tick_ms > 1000 {
            return Err(format!(
                "Invalid tick_ms {}. Must be 1-1000",
                self.runner.tick_ms
            ));
        }

        if self.runner.event_capacity == 0 {
            return Err("runner.event_capacity must be positive".to_string());
        }

        if self.filter.size == 0 || self.filter.size > MAX_FILTER_SIZE {
            return Err(format!(
                "Invalid filter size {}. Must be 1-{MAX_FILTER_SIZE}",
                self.filter.size
            ));
        }

        self.defaults.validate().map_err(|e| e.to_string())?;
        self.limits.validate()?;
        self.geometry.validate()?;

        if self.wells.capacity_ul <= 0.0 {
            return Err("wells.capacity_ul must be positive".to_string());
        }

        Ok(())
    }
}
