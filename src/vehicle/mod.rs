//! # Vehicle Module
//!
//! The interface the supervisor needs from a vehicle handle.
//!
//! The flight-control firmware and the wireless transport live behind
//! [`Vehicle`]. The supervisor only:
//! - connects and disconnects the control link
//! - issues a [`Command`] and awaits the vehicle-reported [`CommandOutcome`]
//! - queries partial state snapshots keyed by [`StateMessage`]
//!
//! Implementations must tolerate concurrent calls from the foreground command
//! flow and the background telemetry sampler.

pub mod sim;

#[cfg(test)]
pub mod mocks;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Keys used in [`StateSnapshot`]s
pub mod fields {
    /// GPS latitude in degrees (500.0 when there is no fix)
    pub const LATITUDE: &str = "latitude";
    /// GPS longitude in degrees (500.0 when there is no fix)
    pub const LONGITUDE: &str = "longitude";
    /// Altitude in meters. GPS altitude in a `GpsLocation` snapshot,
    /// height above take-off in an `Altitude` snapshot.
    pub const ALTITUDE: &str = "altitude";
    /// Battery state of charge (0-100%)
    pub const PERCENT: &str = "percent";
    /// Full battery capacity in mAh
    pub const FULL_CHARGE: &str = "full_charge";
    /// Remaining battery capacity in mAh
    pub const REMAINING: &str = "remaining";
}

/// Link establishment parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Number of connection attempts
    pub retries: u32,
    /// Timeout per attempt
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Piloting command sent to the vehicle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    TakeOff,
    Land,
    /// Relative move in the body frame: forward (m), right (m), down (m), heading (rad)
    MoveBy { dx: f32, dy: f32, dz: f32, dpsi: f32 },
}

impl Command {
    /// Move forward (positive) or backward (negative) along the body x axis
    pub fn forward(distance_m: f32) -> Self {
        Command::MoveBy {
            dx: distance_m,
            dy: 0.0,
            dz: 0.0,
            dpsi: 0.0,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::TakeOff => write!(f, "TakeOff"),
            Command::Land => write!(f, "Landing"),
            Command::MoveBy { dx, dy, dz, dpsi } => {
                write!(f, "moveBy({:.1}, {:.1}, {:.1}, {:.2})", dx, dy, dz, dpsi)
            }
        }
    }
}

/// Flying state as reported by the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlyingState {
    Landed,
    TakingOff,
    Hovering,
    Flying,
    Landing,
    Emergency,
}

impl fmt::Display for FlyingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlyingState::Landed => "landed",
            FlyingState::TakingOff => "takingoff",
            FlyingState::Hovering => "hovering",
            FlyingState::Flying => "flying",
            FlyingState::Landing => "landing",
            FlyingState::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

/// Vehicle-reported result of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    success: bool,
    state: FlyingState,
}

impl CommandOutcome {
    /// The vehicle accepted the command and reached `state`
    pub fn completed(state: FlyingState) -> Self {
        Self { success: true, state }
    }

    /// The vehicle rejected or could not finish the command; it is now in `state`
    pub fn failed(state: FlyingState) -> Self {
        Self { success: false, state }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Flying state when the outcome was reported
    pub fn state(&self) -> FlyingState {
        self.state
    }
}

/// State message identifiers understood by [`Vehicle::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateMessage {
    /// Latitude, longitude and GPS altitude
    GpsLocation,
    /// Height above the take-off point
    Altitude,
    /// Battery percentage
    BatteryState,
    /// Battery capacity figures in mAh
    BatteryCapacity,
}

impl fmt::Display for StateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Partial state snapshot keyed by field name
///
/// A key is absent when the vehicle has not pushed that field yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    fields: BTreeMap<String, f64>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Capabilities of a remotely controlled vehicle
///
/// All methods take `&self` so one handle can be shared (behind an `Arc`)
/// between the command flow and the telemetry sampler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vehicle: Send + Sync {
    /// Establish the control link
    ///
    /// Returns `Ok(false)` when every attempt failed.
    async fn connect(&self, options: ConnectOptions) -> Result<bool>;

    /// Tear down the control link
    async fn disconnect(&self) -> Result<()>;

    /// Issue `command` and resolve once the vehicle reports reaching `expect`
    /// or reports that it cannot.
    ///
    /// Callers bound this with their own timeout; dropping the future must be safe.
    async fn execute(&self, command: Command, expect: FlyingState) -> Result<CommandOutcome>;

    /// Latest snapshot for `message`, or `None` if the vehicle has not sent one yet
    async fn state(&self, message: StateMessage) -> Result<Option<StateSnapshot>>;
}
