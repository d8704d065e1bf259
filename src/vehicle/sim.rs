//! # Simulated Vehicle
//!
//! In-process stand-in for a real drone link, used by the binary and the
//! end-to-end tests. It models:
//! - flying state transitions with realistic (scaled) durations
//! - a GPS that reports the 500.0 no-fix sentinel for its first few reads
//! - height above take-off
//! - a battery that drains per command and is reported through capacity
//!   figures only (like airframes without a direct percentage message)

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    fields, Command, CommandOutcome, ConnectOptions, FlyingState, StateMessage, StateSnapshot,
    Vehicle,
};
use crate::error::{FlightSupervisorError, Result};

/// Latitude/longitude value a vehicle reports before it has a GPS fix
pub const NO_FIX_SENTINEL: f64 = 500.0;

/// Meters per degree of latitude
const METERS_PER_DEGREE: f64 = 111_320.0;

/// States a landing can start from, including ones left behind by an interrupted command
const LANDABLE: &[FlyingState] = &[
    FlyingState::TakingOff,
    FlyingState::Hovering,
    FlyingState::Flying,
    FlyingState::Landing,
];

/// Tunables for [`SimulatedVehicle`]
#[derive(Debug, Clone)]
pub struct SimProfile {
    /// Whether `connect` succeeds
    pub reachable: bool,
    /// Duration of a take-off or a landing
    pub climb_time: Duration,
    /// Horizontal speed for relative moves
    pub speed_mps: f32,
    /// Height reached after take-off
    pub takeoff_height_m: f64,
    /// Number of GPS reads answered with the no-fix sentinel
    pub gps_fix_after_reads: u32,
    /// Take-off position (latitude, longitude, altitude above sea level)
    pub home: (f64, f64, f64),
    pub full_charge_mah: f64,
    pub initial_remaining_mah: f64,
    /// Charge consumed by each command
    pub drain_per_command_mah: f64,
    /// Also answer `BatteryState` with a direct percentage
    pub reports_percent: bool,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            reachable: true,
            climb_time: Duration::from_secs(3),
            speed_mps: 1.0,
            takeoff_height_m: 1.0,
            gps_fix_after_reads: 2,
            home: (48.878_922, 2.367_782, 35.0),
            full_charge_mah: 4000.0,
            initial_remaining_mah: 3400.0,
            drain_per_command_mah: 40.0,
            reports_percent: false,
        }
    }
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    flying: FlyingState,
    north_m: f64,
    height_m: f64,
    remaining_mah: f64,
    gps_reads: u32,
}

/// Simulated drone implementing [`Vehicle`]
#[derive(Debug)]
pub struct SimulatedVehicle {
    profile: SimProfile,
    state: Mutex<SimState>,
}

impl SimulatedVehicle {
    pub fn new(profile: SimProfile) -> Self {
        let state = SimState {
            connected: false,
            flying: FlyingState::Landed,
            north_m: 0.0,
            height_m: 0.0,
            remaining_mah: profile.initial_remaining_mah,
            gps_reads: 0,
        };
        Self {
            profile,
            state: Mutex::new(state),
        }
    }

    /// Current flying state
    pub async fn flying_state(&self) -> FlyingState {
        self.state.lock().await.flying
    }

    /// Distance travelled north of the take-off point
    pub async fn displacement_m(&self) -> f64 {
        self.state.lock().await.north_m
    }

    /// Enter a transitional state, returning the current state on refusal
    async fn begin(&self, allowed: &[FlyingState], transitional: FlyingState) -> Result<Option<FlyingState>> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(FlightSupervisorError::Vehicle("not connected".to_string()));
        }
        if !allowed.contains(&state.flying) {
            return Ok(Some(state.flying));
        }
        state.flying = transitional;
        state.remaining_mah = (state.remaining_mah - self.profile.drain_per_command_mah).max(0.0);
        Ok(None)
    }
}

#[async_trait]
impl Vehicle for SimulatedVehicle {
    async fn connect(&self, options: ConnectOptions) -> Result<bool> {
        debug!("Simulated connect (retries: {}, timeout: {:?})", options.retries, options.timeout);
        if !self.profile.reachable {
            return Ok(false);
        }
        self.state.lock().await.connected = true;
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn execute(&self, command: Command, expect: FlyingState) -> Result<CommandOutcome> {
        debug!("Simulated {} (expecting {})", command, expect);
        let reached = match command {
            Command::TakeOff => {
                if let Some(current) = self.begin(&[FlyingState::Landed], FlyingState::TakingOff).await? {
                    return Ok(CommandOutcome::failed(current));
                }
                tokio::time::sleep(self.profile.climb_time).await;
                let mut state = self.state.lock().await;
                state.height_m = self.profile.takeoff_height_m;
                state.flying = FlyingState::Hovering;
                state.flying
            }
            Command::MoveBy { dx, .. } => {
                if let Some(current) = self.begin(&[FlyingState::Hovering], FlyingState::Flying).await? {
                    return Ok(CommandOutcome::failed(current));
                }
                let travel = f64::from(dx.abs() / self.profile.speed_mps.max(0.01));
                tokio::time::sleep(Duration::from_secs_f64(travel)).await;
                let mut state = self.state.lock().await;
                state.north_m += f64::from(dx);
                state.flying = FlyingState::Hovering;
                state.flying
            }
            Command::Land => {
                if let Some(current) = self.begin(LANDABLE, FlyingState::Landing).await? {
                    return Ok(CommandOutcome::failed(current));
                }
                tokio::time::sleep(self.profile.climb_time).await;
                let mut state = self.state.lock().await;
                state.height_m = 0.0;
                state.flying = FlyingState::Landed;
                state.flying
            }
        };
        Ok(CommandOutcome::completed(reached))
    }

    async fn state(&self, message: StateMessage) -> Result<Option<StateSnapshot>> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(FlightSupervisorError::Vehicle("not connected".to_string()));
        }

        let snapshot = match message {
            StateMessage::GpsLocation => {
                state.gps_reads += 1;
                if state.gps_reads <= self.profile.gps_fix_after_reads {
                    StateSnapshot::new()
                        .with(fields::LATITUDE, NO_FIX_SENTINEL)
                        .with(fields::LONGITUDE, NO_FIX_SENTINEL)
                } else {
                    let (lat, lon, alt) = self.profile.home;
                    StateSnapshot::new()
                        .with(fields::LATITUDE, lat + state.north_m / METERS_PER_DEGREE)
                        .with(fields::LONGITUDE, lon)
                        .with(fields::ALTITUDE, alt + state.height_m)
                }
            }
            StateMessage::Altitude => StateSnapshot::new().with(fields::ALTITUDE, state.height_m),
            StateMessage::BatteryState => {
                if !self.profile.reports_percent {
                    return Ok(None);
                }
                let pct = 100.0 * state.remaining_mah / self.profile.full_charge_mah;
                StateSnapshot::new().with(fields::PERCENT, pct.round())
            }
            StateMessage::BatteryCapacity => StateSnapshot::new()
                .with(fields::FULL_CHARGE, self.profile.full_charge_mah)
                .with(fields::REMAINING, state.remaining_mah.round()),
        };
        Ok(Some(snapshot))
    }
}
