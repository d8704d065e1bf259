//! # Telemetry Module
//!
//! Vehicle telemetry capture and the append-only flight log.
//!
//! This module handles:
//! - Reading partial vehicle state into a fixed-shape [`TelemetrySample`]
//! - Tagging samples with capture time, flight run and [`FlightPhase`]
//! - Appending [`TelemetryRecord`]s to a CSV flight log with a stable column order

pub mod log;
pub mod reader;

use chrono::{DateTime, Utc};
use std::fmt;

pub use log::FlightLog;
pub use reader::TelemetryReader;

/// Timestamp rendering used in the flight log (UTC, second resolution)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Run identifier rendering (UTC time of session creation)
const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// What the vehicle was doing when a record was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightPhase {
    Connected,
    InFlight,
    Disconnected,
}

impl FlightPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightPhase::Connected => "connected",
            FlightPhase::InFlight => "in_flight",
            FlightPhase::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for FlightPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier shared by every record of one flight
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a run id from the current UTC time
    pub fn generate() -> Self {
        Self(Utc::now().format(RUN_ID_FORMAT).to_string())
    }

    /// Derive a run id from the current UTC time that differs from `previous`
    ///
    /// A second run started within the same second as `previous` gets a
    /// `_2`, `_3`, ... suffix.
    pub fn generate_after(previous: &RunId) -> Self {
        let fresh = Self::generate();
        let Some(rest) = previous.0.strip_prefix(fresh.as_str()) else {
            return fresh;
        };

        let count = if rest.is_empty() {
            1
        } else {
            match rest.strip_prefix('_').and_then(|n| n.parse::<u32>().ok()) {
                Some(n) => n,
                None => return fresh,
            }
        };
        Self(format!("{}_{}", fresh.0, count + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional telemetry fields read from the vehicle
///
/// Every field is `None` when the vehicle had not (validly) reported it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySample {
    /// Latitude in degrees
    pub latitude: Option<f64>,

    /// Longitude in degrees
    pub longitude: Option<f64>,

    /// GPS altitude in meters
    pub altitude_m: Option<f64>,

    /// Height above the take-off point in meters
    pub altitude_above_takeoff_m: Option<f64>,

    /// Battery state of charge (0-100%)
    pub battery_pct: Option<f64>,

    /// Remaining capacity in mAh
    pub battery_remaining_mah: Option<u32>,

    /// Full capacity in mAh
    pub battery_full_mah: Option<u32>,
}

impl TelemetrySample {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One flight log entry
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    pub phase: FlightPhase,
    pub sample: TelemetrySample,
}

impl TelemetryRecord {
    pub fn new(timestamp: DateTime<Utc>, run_id: RunId, phase: FlightPhase, sample: TelemetrySample) -> Self {
        Self {
            timestamp,
            run_id,
            phase,
            sample,
        }
    }

    /// Column values in flight log order; absent fields are empty strings
    pub fn columns(&self) -> [String; 10] {
        let s = &self.sample;
        [
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            self.run_id.to_string(),
            self.phase.to_string(),
            fixed(s.latitude, 6),
            fixed(s.longitude, 6),
            fixed(s.altitude_m, 2),
            fixed(s.altitude_above_takeoff_m, 2),
            fixed(s.battery_pct, 1),
            s.battery_remaining_mah.map(|v| v.to_string()).unwrap_or_default(),
            s.battery_full_mah.map(|v| v.to_string()).unwrap_or_default(),
        ]
    }
}

fn fixed(value: Option<f64>, decimals: usize) -> String {
    value
        .map(|v| format!("{:.*}", decimals, v))
        .unwrap_or_default()
}
