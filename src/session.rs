//! # Session Module
//!
//! Binds a background telemetry sampler to the lifetime of a vehicle control
//! session.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Idle
//! ```
//!
//! After a successful connect the session waits for the vehicle's initial
//! state burst, logs a `connected` record and starts the sampler. On
//! disconnect the sampler is cancelled and joined *before* the final
//! `disconnected` record is written and the link is torn down, so the log has
//! a single writer at any instant and nothing touches the vehicle after its
//! disconnect.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::telemetry::{FlightLog, FlightPhase, RunId, TelemetryReader, TelemetryRecord};
use crate::vehicle::{Command, CommandOutcome, ConnectOptions, FlyingState, StateMessage, StateSnapshot, Vehicle};

/// Connectivity state of a [`FlightSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Running background sampler
struct Sampler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Control session with continuous telemetry logging
pub struct FlightSession {
    vehicle: Arc<dyn Vehicle>,
    run_id: RunId,
    /// Whether `run_id` already tagged a session, so the next one needs a new id
    run_id_used: bool,
    state: SessionState,
    log: Arc<FlightLog>,
    reader: TelemetryReader,
    timing: SessionConfig,
    sampler: Option<Sampler>,
}

impl FlightSession {
    /// Create an idle session
    ///
    /// The first session uses a run id derived from the creation time; every
    /// later reconnect gets a new one.
    pub fn new(vehicle: Arc<dyn Vehicle>, log: FlightLog, reader: TelemetryReader, timing: SessionConfig) -> Self {
        Self {
            vehicle,
            run_id: RunId::generate(),
            run_id_used: false,
            state: SessionState::Idle,
            log: Arc::new(log),
            reader,
            timing,
            sampler: None,
        }
    }

    /// Use `run_id` for the next session instead of a generated one
    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self.run_id_used = false;
        self
    }

    /// Run id of the current or most recent session
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Upper bound on a single state query
    pub fn read_timeout(&self) -> Duration {
        self.reader.read_timeout()
    }

    pub fn status(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Whether the background sampler is currently running
    pub fn is_sampling(&self) -> bool {
        self.sampler
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Connect to the vehicle and start telemetry logging
    ///
    /// Returns `false` if the vehicle could not be reached. In that case
    /// nothing is logged and no sampler is started.
    pub async fn connect(&mut self, options: ConnectOptions) -> bool {
        if self.state != SessionState::Idle {
            warn!("Connect requested while session is {:?}", self.state);
            return self.is_connected();
        }

        self.state = SessionState::Connecting;
        if self.run_id_used {
            self.run_id = RunId::generate_after(&self.run_id);
            self.run_id_used = false;
        }
        info!("Connecting to vehicle (run {})", self.run_id);

        match self.vehicle.connect(options).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Vehicle refused connection after {} attempts", options.retries);
                self.state = SessionState::Idle;
                return false;
            }
            Err(e) => {
                error!("Vehicle connection failed: {}", e);
                self.state = SessionState::Idle;
                return false;
            }
        }

        self.state = SessionState::Connected;
        self.run_id_used = true;
        info!("Connected, waiting {:?} for initial state", self.timing.settle());
        sleep(self.timing.settle()).await;

        let record = capture(self.vehicle.as_ref(), &self.reader, &self.run_id, FlightPhase::Connected).await;
        if let Err(e) = self.log.append(&record) {
            warn!("Failed to log connected record: {}", e);
        }

        self.start_sampler();
        true
    }

    /// Stop telemetry logging and disconnect from the vehicle
    ///
    /// No-op when the session is idle. Never fails: log and link errors are
    /// reported through `tracing` and discarded.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Idle {
            debug!("Disconnect on idle session ignored");
            return;
        }

        self.state = SessionState::Disconnecting;
        self.stop_sampler().await;

        let record = capture(self.vehicle.as_ref(), &self.reader, &self.run_id, FlightPhase::Disconnected).await;
        if let Err(e) = self.log.append(&record) {
            warn!("Failed to log disconnected record: {}", e);
        }

        if let Err(e) = self.vehicle.disconnect().await {
            warn!("Vehicle disconnect failed: {}", e);
        }

        self.state = SessionState::Idle;
        info!("Session {} closed", self.run_id);
    }

    /// Pass a command through to the vehicle unchanged
    pub async fn forward(&self, command: Command, expect: FlyingState) -> Result<CommandOutcome> {
        self.vehicle.execute(command, expect).await
    }

    /// Pass a state query through to the vehicle unchanged
    pub async fn state(&self, message: StateMessage) -> Result<Option<StateSnapshot>> {
        self.vehicle.state(message).await
    }

    fn start_sampler(&mut self) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let vehicle = Arc::clone(&self.vehicle);
        let log = Arc::clone(&self.log);
        let reader = self.reader.clone();
        let run_id = self.run_id.clone();
        let period = self.timing.sample_interval().max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let record = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    record = capture(vehicle.as_ref(), &reader, &run_id, FlightPhase::InFlight) => record,
                };

                if let Err(e) = log.append(&record) {
                    warn!("Failed to log telemetry: {}", e);
                }
            }

            debug!("Telemetry sampler stopped");
        });

        debug!("Telemetry sampler started (every {:?})", period);
        self.sampler = Some(Sampler { cancel, handle });
    }

    async fn stop_sampler(&mut self) {
        let Some(Sampler { cancel, mut handle }) = self.sampler.take() else {
            return;
        };

        cancel.cancel();
        match timeout(self.timing.join_timeout(), &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Telemetry sampler ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Telemetry sampler did not stop within {:?}, aborting it",
                    self.timing.join_timeout()
                );
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

impl Drop for FlightSession {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.cancel.cancel();
            sampler.handle.abort();
        }
    }
}

/// Read one sample and stamp it with the time the read started
async fn capture(vehicle: &dyn Vehicle, reader: &TelemetryReader, run_id: &RunId, phase: FlightPhase) -> TelemetryRecord {
    let timestamp = Utc::now();
    let sample = reader.sample(vehicle).await;
    TelemetryRecord::new(timestamp, run_id.clone(), phase, sample)
}
