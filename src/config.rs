//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `TESTBED_`, sections split by `__`)
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration.
//!
//! # Example
//! ```no_run
//! use testbed_daq::config::TestbedConfig;
//!
//! let config = TestbedConfig::load_from("config/testbed.toml")?;
//! println!("Device port: {}", config.device.port);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::orchestrator::ControlParameters;
use crate::tracing_init::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device-under-test serial link
    pub device: DeviceConfig,
    /// Secondary measurement instrument
    pub instrument: InstrumentConfig,
    /// Telemetry log storage
    pub telemetry: TelemetryConfig,
    /// Tick loop and closed-loop setpoint control
    pub control: ControlConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Testbed".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Serial link to the device-under-test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate of the device link
    pub baud_rate: u32,
    /// Budget for one complete request/response exchange
    pub exchange_timeout_ms: u64,
    /// Timeout of a single port read; must be shorter than the exchange budget
    pub read_timeout_ms: u64,
    /// Measurement channels read on every tick
    pub channels: Vec<u8>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_device_port(),
            baud_rate: 9600,
            exchange_timeout_ms: 500,
            read_timeout_ms: 50,
            channels: vec![0, 1, 2],
        }
    }
}

impl DeviceConfig {
    /// Budget for one request/response exchange.
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

/// Secondary instrument polled on its own thread
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Serial port path of the instrument
    pub port: String,
    /// Baud rate of the instrument link
    pub baud_rate: u32,
    /// Read timeout for one SCPI reply line
    pub read_timeout_ms: u64,
    /// Line terminator appended to every SCPI command
    pub terminator: String,
    /// Scan-list channels measured per iteration
    pub channels: Vec<u16>,
    /// Sleep between checks while paused
    pub idle_interval_ms: u64,
    /// Capacity of the hand-off queue
    pub queue_capacity: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            port: default_instrument_port(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            terminator: "\n".to_string(),
            channels: vec![101, 102],
            idle_interval_ms: 100,
            queue_capacity: 64,
        }
    }
}

/// Telemetry log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Directory holding the active log files
    pub directory: PathBuf,
    /// File name prefix for log and archive files
    pub file_prefix: String,
    /// Directory receiving archived windows
    pub archive_directory: PathBuf,
    /// Decimal places written for every numeric field
    pub precision: usize,
    /// Number of records in the tail window
    pub window_size: usize,
    /// Fallback average record length used by the tail reader
    pub record_len_hint: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            file_prefix: "telemetry".to_string(),
            archive_directory: PathBuf::from("data/archive"),
            precision: 4,
            window_size: 60,
            record_len_hint: 64,
        }
    }
}

/// Tick loop and setpoint control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Period of the orchestrator tick
    pub tick_interval_ms: u64,
    /// Setpoint requested when a session starts
    pub initial_setpoint: f64,
    /// Increment applied when the window is stable
    pub setpoint_step: f64,
    /// Lowest setpoint the instrument accepts
    pub setpoint_min: f64,
    /// Highest setpoint; advancing past it finishes the experiment
    pub setpoint_max: f64,
    /// Minimum dwell at one setpoint before a stability check
    pub transition_interval_secs: u64,
    /// RMS deviation at or below which the window counts as stable
    pub stability_threshold: f64,
    /// Record field the statistics are computed over
    pub stats_field: usize,
    /// Consecutive failed ticks before the session is halted (0 = never)
    pub max_consecutive_failures: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            initial_setpoint: 1.0,
            setpoint_step: 0.5,
            setpoint_min: 0.0,
            setpoint_max: 10.0,
            transition_interval_secs: 300,
            stability_threshold: 0.05,
            stats_field: 0,
            max_consecutive_failures: 10,
        }
    }
}

impl ControlConfig {
    /// Tick period as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_device_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_instrument_port() -> String {
    if cfg!(windows) {
        "COM4".to_string()
    } else {
        "/dev/ttyUSB1".to_string()
    }
}

impl TestbedConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file with prefix `TESTBED_`.
    /// Example: `TESTBED_CONTROL__SETPOINT_STEP=0.25`
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TESTBED_").split("__"))
            .extract()
    }

    /// Number of fields in one telemetry record.
    pub fn record_width(&self) -> usize {
        self.device.channels.len() + self.instrument.channels.len()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.application.log_format.parse::<OutputFormat>()?;

        if self.device.channels.is_empty() {
            return Err("device.channels must list at least one channel".to_string());
        }
        if self.instrument.channels.is_empty() {
            return Err("instrument.channels must list at least one channel".to_string());
        }
        if self.device.read_timeout_ms >= self.device.exchange_timeout_ms {
            return Err(format!(
                "device.read_timeout_ms ({}) must be below exchange_timeout_ms ({})",
                self.device.read_timeout_ms, self.device.exchange_timeout_ms
            ));
        }
        if self.instrument.queue_capacity == 0 {
            return Err("instrument.queue_capacity must be greater than 0".to_string());
        }

        if self.telemetry.precision > 12 {
            return Err(format!(
                "Invalid telemetry.precision {}. Must be 0-12",
                self.telemetry.precision
            ));
        }
        if self.telemetry.window_size == 0 {
            return Err("telemetry.window_size must be greater than 0".to_string());
        }

        let control = &self.control;
        if control.setpoint_min > control.setpoint_max {
            return Err(format!(
                "control.setpoint_min ({}) exceeds setpoint_max ({})",
                control.setpoint_min, control.setpoint_max
            ));
        }
        if control.setpoint_step <= 0.0 {
            return Err("control.setpoint_step must be positive".to_string());
        }
        if !(control.setpoint_min..=control.setpoint_max).contains(&control.initial_setpoint) {
            return Err(format!(
                "control.initial_setpoint {} outside [{}, {}]",
                control.initial_setpoint, control.setpoint_min, control.setpoint_max
            ));
        }
        if control.stats_field >= self.record_width() {
            return Err(format!(
                "control.stats_field {} beyond record width {}",
                control.stats_field,
                self.record_width()
            ));
        }

        Ok(())
    }

    /// Initial control parameters derived from this configuration.
    pub fn control_parameters(&self) -> ControlParameters {
        ControlParameters {
            setpoint: self.control.initial_setpoint,
            setpoint_step: self.control.setpoint_step,
            setpoint_max: self.control.setpoint_max,
            transition_interval: Duration::from_secs(self.control.transition_interval_secs),
            stability_threshold: self.control.stability_threshold,
            stats_field: self.control.stats_field,
            window_size: self.telemetry.window_size,
        }
    }
}
