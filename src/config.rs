//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all, see [`Config::load_or_default`]) yields the stock out-and-back flight.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{FlightSupervisorError, Result};
use crate::vehicle::ConnectOptions;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub flight: FlightConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Vehicle link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct VehicleConfig {
    #[serde(default = "default_vehicle_address")]
    pub address: String,

    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
}

/// Session wrapper timing
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Wait after connect so the vehicle can push its initial state burst
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Period of the background telemetry sampler
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Upper bound on waiting for the sampler to stop during disconnect
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

/// Telemetry reader and flight log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_path")]
    pub log_path: String,

    #[serde(default = "default_battery_retries")]
    pub battery_retries: u32,

    #[serde(default = "default_battery_retry_backoff_ms")]
    pub battery_retry_backoff_ms: u64,

    /// Upper bound on a single state query
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Flight plan configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FlightConfig {
    #[serde(default = "default_countdown_s")]
    pub countdown_s: u64,

    #[serde(default = "default_move_distance_m")]
    pub move_distance_m: f32,

    #[serde(default = "default_takeoff_timeout_s")]
    pub takeoff_timeout_s: u64,

    #[serde(default = "default_move_timeout_s")]
    pub move_timeout_s: u64,

    #[serde(default = "default_land_timeout_s")]
    pub land_timeout_s: u64,

    #[serde(default = "default_abort_land_timeout_s")]
    pub abort_land_timeout_s: u64,

    #[serde(default = "default_hover_ms")]
    pub hover_ms: u64,

    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,

    #[serde(default = "default_pre_land_ms")]
    pub pre_land_ms: u64,
}

/// Operator log output
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional file that receives a copy of the operator log (empty = stdout only)
    #[serde(default)]
    pub file: String,
}

// Default value functions
fn default_vehicle_address() -> String { "192.168.42.1".to_string() }
fn default_connect_retries() -> u32 { 5 }
fn default_connect_timeout_s() -> u64 { 10 }

fn default_settle_ms() -> u64 { 2000 }
fn default_sample_interval_ms() -> u64 { 2000 }
fn default_join_timeout_ms() -> u64 { 3000 }

fn default_log_path() -> String { "flight_log.csv".to_string() }
fn default_battery_retries() -> u32 { 3 }
fn default_battery_retry_backoff_ms() -> u64 { 500 }
fn default_read_timeout_ms() -> u64 { 1000 }

fn default_countdown_s() -> u64 { 5 }
fn default_move_distance_m() -> f32 { 5.0 }
fn default_takeoff_timeout_s() -> u64 { 15 }
fn default_move_timeout_s() -> u64 { 25 }
fn default_land_timeout_s() -> u64 { 15 }
fn default_abort_land_timeout_s() -> u64 { 10 }
fn default_hover_ms() -> u64 { 2000 }
fn default_hold_ms() -> u64 { 3000 }
fn default_pre_land_ms() -> u64 { 2000 }

fn default_log_level() -> String { "info".to_string() }

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            address: default_vehicle_address(),
            connect_retries: default_connect_retries(),
            connect_timeout_s: default_connect_timeout_s(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            battery_retries: default_battery_retries(),
            battery_retry_backoff_ms: default_battery_retry_backoff_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            countdown_s: default_countdown_s(),
            move_distance_m: default_move_distance_m(),
            takeoff_timeout_s: default_takeoff_timeout_s(),
            move_timeout_s: default_move_timeout_s(),
            land_timeout_s: default_land_timeout_s(),
            abort_land_timeout_s: default_abort_land_timeout_s(),
            hover_ms: default_hover_ms(),
            hold_ms: default_hold_ms(),
            pre_land_ms: default_pre_land_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
        }
    }
}

impl VehicleConfig {
    /// Connection parameters handed to [`crate::vehicle::Vehicle::connect`]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            retries: self.connect_retries,
            timeout: Duration::from_secs(self.connect_timeout_s),
        }
    }
}

impl SessionConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl TelemetryConfig {
    pub fn battery_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.battery_retry_backoff_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn invalid(msg: impl std::fmt::Display) -> FlightSupervisorError {
    FlightSupervisorError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use flight_supervisor::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from `path`, or the built-in defaults if the file does not exist
    ///
    /// A file that exists but fails to parse or validate is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Vehicle link
        if self.vehicle.address.is_empty() {
            return Err(invalid("vehicle address cannot be empty"));
        }

        if self.vehicle.connect_retries == 0 || self.vehicle.connect_retries > 20 {
            return Err(invalid("connect_retries must be between 1 and 20"));
        }

        if self.vehicle.connect_timeout_s == 0 || self.vehicle.connect_timeout_s > 120 {
            return Err(invalid("connect_timeout_s must be between 1 and 120"));
        }

        // Session timing
        if self.session.settle_ms > 30000 {
            return Err(invalid("settle_ms must be at most 30000"));
        }

        if self.session.sample_interval_ms == 0 || self.session.sample_interval_ms > 60000 {
            return Err(invalid("sample_interval_ms must be between 1 and 60000"));
        }

        if self.session.join_timeout_ms == 0 || self.session.join_timeout_ms > 60000 {
            return Err(invalid("join_timeout_ms must be between 1 and 60000"));
        }

        // Telemetry
        if self.telemetry.log_path.is_empty() {
            return Err(invalid("telemetry log_path cannot be empty"));
        }

        if self.telemetry.battery_retries == 0 || self.telemetry.battery_retries > 10 {
            return Err(invalid("battery_retries must be between 1 and 10"));
        }

        if self.telemetry.battery_retry_backoff_ms > 10000 {
            return Err(invalid("battery_retry_backoff_ms must be at most 10000"));
        }

        if self.telemetry.read_timeout_ms == 0 || self.telemetry.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        // Flight plan
        if self.flight.countdown_s > 60 {
            return Err(invalid("countdown_s must be at most 60"));
        }

        let distance = self.flight.move_distance_m;
        if !distance.is_finite() || distance <= 0.0 || distance > 50.0 {
            return Err(invalid("move_distance_m must be greater than 0.0 and at most 50.0"));
        }

        for (name, value) in [
            ("takeoff_timeout_s", self.flight.takeoff_timeout_s),
            ("move_timeout_s", self.flight.move_timeout_s),
            ("land_timeout_s", self.flight.land_timeout_s),
            ("abort_land_timeout_s", self.flight.abort_land_timeout_s),
        ] {
            if value == 0 || value > 300 {
                return Err(invalid(format!("{} must be between 1 and 300", name)));
            }
        }

        for (name, value) in [
            ("hover_ms", self.flight.hover_ms),
            ("hold_ms", self.flight.hold_ms),
            ("pre_land_ms", self.flight.pre_land_ms),
        ] {
            if value > 60000 {
                return Err(invalid(format!("{} must be at most 60000", name)));
            }
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}
