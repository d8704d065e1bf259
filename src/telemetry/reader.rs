//! # Telemetry Reader
//!
//! Reads the vehicle's current state into a [`TelemetrySample`].
//!
//! Each state message is read independently: a failed, timed out or missing
//! read leaves only its own fields empty. Reads are repeated (with a fixed
//! backoff) until a battery percentage is known or the attempts run out,
//! because right after connect the vehicle may not have pushed its first
//! battery event yet.

use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

use super::TelemetrySample;
use crate::config::TelemetryConfig;
use crate::vehicle::{fields, StateMessage, StateSnapshot, Vehicle};

/// Latitude/longitude value meaning "no GPS fix"
pub const INVALID_COORDINATE: f64 = 500.0;

/// Default number of read attempts per sample
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default pause between attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Default upper bound on one state query
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Samples vehicle state with bounded retries
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    attempts: u32,
    backoff: Duration,
    read_timeout: Duration,
}

impl Default for TelemetryReader {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, DEFAULT_READ_TIMEOUT)
    }
}

impl TelemetryReader {
    /// Create a reader
    ///
    /// # Arguments
    ///
    /// * `attempts` - Read attempts per sample (at least one is always made)
    /// * `backoff` - Pause between attempts
    /// * `read_timeout` - Upper bound on each individual state query
    pub fn new(attempts: u32, backoff: Duration, read_timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            read_timeout,
        }
    }

    /// Upper bound on each individual state query
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(
            config.battery_retries,
            config.battery_retry_backoff(),
            config.read_timeout(),
        )
    }

    /// Read the vehicle's current position, altitude and battery
    ///
    /// Never fails: fields that could not be read are `None`. Values found by
    /// an earlier attempt are kept if a later attempt cannot read them.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use flight_supervisor::telemetry::TelemetryReader;
    /// # use flight_supervisor::vehicle::Vehicle;
    /// # async fn example(vehicle: &dyn Vehicle) {
    /// let sample = TelemetryReader::default().sample(vehicle).await;
    /// if let Some(pct) = sample.battery_pct {
    ///     println!("Battery: {:.1}%", pct);
    /// }
    /// # }
    /// ```
    pub async fn sample(&self, vehicle: &dyn Vehicle) -> TelemetrySample {
        let mut sample = TelemetrySample::default();

        for attempt in 0..self.attempts {
            if let Some(gps) = self.read(vehicle, StateMessage::GpsLocation).await {
                apply_gps(&gps, &mut sample);
            }

            if let Some(alt) = self.read(vehicle, StateMessage::Altitude).await {
                if let Some(a) = alt.get(fields::ALTITUDE).filter(|a| a.is_finite()) {
                    sample.altitude_above_takeoff_m = Some(round_to(a, 2));
                }
            }

            if let Some(battery) = self.read(vehicle, StateMessage::BatteryState).await {
                if let Some(pct) = battery.get(fields::PERCENT).filter(|p| (0.0..=100.0).contains(p)) {
                    sample.battery_pct = Some(round_to(pct, 1));
                }
            }

            // Capacity after the direct percentage, so it only fills the gap
            if let Some(capacity) = self.read(vehicle, StateMessage::BatteryCapacity).await {
                apply_capacity(&capacity, &mut sample);
            }

            if sample.battery_pct.is_some() {
                break;
            }

            if attempt + 1 < self.attempts {
                debug!("No battery level yet (attempt {}/{}), retrying", attempt + 1, self.attempts);
                sleep(self.backoff).await;
            }
        }

        sample
    }

    async fn read(&self, vehicle: &dyn Vehicle, message: StateMessage) -> Option<StateSnapshot> {
        match timeout(self.read_timeout, vehicle.state(message)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                debug!("Failed to read {}: {}", message, e);
                None
            }
            Err(_) => {
                debug!("Reading {} timed out after {:?}", message, self.read_timeout);
                None
            }
        }
    }
}

fn apply_gps(gps: &StateSnapshot, sample: &mut TelemetrySample) {
    let valid = |v: &f64| v.is_finite() && *v != INVALID_COORDINATE;

    if let (Some(lat), Some(lon)) = (
        gps.get(fields::LATITUDE).filter(valid),
        gps.get(fields::LONGITUDE).filter(valid),
    ) {
        sample.latitude = Some(round_to(lat, 6));
        sample.longitude = Some(round_to(lon, 6));
    }

    if let Some(alt) = gps.get(fields::ALTITUDE).filter(|a| a.is_finite()) {
        sample.altitude_m = Some(round_to(alt, 2));
    }
}

fn apply_capacity(capacity: &StateSnapshot, sample: &mut TelemetrySample) {
    let (Some(full), Some(remaining)) = (
        capacity.get(fields::FULL_CHARGE),
        capacity.get(fields::REMAINING),
    ) else {
        return;
    };

    let max = f64::from(u32::MAX);
    if !(full > 0.0 && full <= max) {
        return;
    }
    sample.battery_full_mah = Some(full.round() as u32);

    // A negative or out-of-range remaining charge is a bad reading, not an empty battery
    if !(0.0..=max).contains(&remaining) {
        return;
    }
    sample.battery_remaining_mah = Some(remaining.round() as u32);

    if sample.battery_pct.is_none() {
        let pct = (100.0 * remaining / full).clamp(0.0, 100.0);
        sample.battery_pct = Some(round_to(pct, 1));
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
