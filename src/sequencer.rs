//! # Command Sequencer
//!
//! Flies a fixed plan through a [`FlightSession`]:
//!
//! ```text
//! connect -> take off -> hover -> move +d -> hold -> move -d -> land -> disconnect
//! ```
//!
//! Every step is bounded by its own timeout. Any step failure (timeout,
//! rejection, unexpected terminal state, link error or operator abort) is
//! answered with exactly one recovery landing and one disconnect. Failed steps
//! are never retried.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FlightConfig;
use crate::session::FlightSession;
use crate::vehicle::{fields, Command, ConnectOptions, FlyingState, StateMessage};

/// One command of a flight plan
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStep {
    pub name: String,
    pub command: Command,
    /// Flying state the vehicle must report when the command completes
    pub expect: FlyingState,
    pub timeout: Duration,
    /// Pause after successful completion
    pub dwell: Duration,
}

impl CommandStep {
    pub fn new(name: impl Into<String>, command: Command, expect: FlyingState, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command,
            expect,
            timeout,
            dwell: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }
}

/// Ordered commands plus the landings that close the flight
#[derive(Debug, Clone)]
pub struct FlightPlan {
    /// Safety countdown before the first step
    pub countdown: Duration,
    pub steps: Vec<CommandStep>,
    /// Nominal landing after the last step
    pub land: CommandStep,
    /// Landing issued when a step fails
    pub recovery_land: CommandStep,
}

impl FlightPlan {
    /// Take off, fly `move_distance_m` forward, come back and land
    pub fn out_and_back(config: &FlightConfig) -> Self {
        let secs = Duration::from_secs;
        let millis = Duration::from_millis;
        let distance = config.move_distance_m;

        Self {
            countdown: secs(config.countdown_s),
            steps: vec![
                CommandStep::new("take_off", Command::TakeOff, FlyingState::Hovering, secs(config.takeoff_timeout_s))
                    .with_dwell(millis(config.hover_ms)),
                CommandStep::new(
                    "move_forward",
                    Command::forward(distance),
                    FlyingState::Hovering,
                    secs(config.move_timeout_s),
                )
                .with_dwell(millis(config.hold_ms)),
                CommandStep::new(
                    "move_backward",
                    Command::forward(-distance),
                    FlyingState::Hovering,
                    secs(config.move_timeout_s),
                )
                .with_dwell(millis(config.pre_land_ms)),
            ],
            land: CommandStep::new("land", Command::Land, FlyingState::Landed, secs(config.land_timeout_s)),
            recovery_land: CommandStep::new(
                "recovery_land",
                Command::Land,
                FlyingState::Landed,
                secs(config.abort_land_timeout_s),
            ),
        }
    }
}

/// Phase reported by the [`Sequencer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    NotConnected,
    Hovering,
    Moving,
    Landed,
    Disconnected,
    Aborted,
}

/// Why a step did not complete
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by vehicle (state: {0})")]
    Rejected(FlyingState),

    #[error("expected {expected}, vehicle reported {actual}")]
    UnexpectedState { expected: FlyingState, actual: FlyingState },

    #[error("link error: {0}")]
    Link(String),

    #[error("aborted by operator")]
    Aborted,
}

/// Result of [`Sequencer::run`]
#[derive(Debug, Clone, PartialEq)]
pub enum FlightOutcome {
    /// The vehicle could not be reached; nothing was flown
    ConnectFailed,
    /// A step failed and the flight was ended with a recovery landing
    StepFailed {
        step: String,
        cause: StepFailure,
        /// Whether the vehicle confirmed the recovery landing
        recovery_landed: bool,
    },
    /// Every step completed and the landing was confirmed
    Landed,
    /// Every step completed but the landing was not confirmed
    LandedWithWarning,
}

impl FlightOutcome {
    pub fn is_landed(&self) -> bool {
        matches!(self, FlightOutcome::Landed)
    }
}

impl fmt::Display for FlightOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightOutcome::ConnectFailed => write!(f, "connection failed"),
            FlightOutcome::StepFailed {
                step,
                cause,
                recovery_landed,
            } => write!(
                f,
                "step '{}' failed ({}), recovery landing {}",
                step,
                cause,
                if *recovery_landed { "confirmed" } else { "NOT confirmed" }
            ),
            FlightOutcome::Landed => write!(f, "landed"),
            FlightOutcome::LandedWithWarning => write!(f, "landed with warning (landing not confirmed)"),
        }
    }
}

/// Drives a [`FlightPlan`] through a [`FlightSession`]
pub struct Sequencer {
    session: FlightSession,
    connect_options: ConnectOptions,
    state: SequencerState,
    current_step: Option<usize>,
    abort: CancellationToken,
}

impl Sequencer {
    pub fn new(session: FlightSession, connect_options: ConnectOptions) -> Self {
        Self {
            session,
            connect_options,
            state: SequencerState::NotConnected,
            current_step: None,
            abort: CancellationToken::new(),
        }
    }

    /// Token that requests an abort-to-land when cancelled
    ///
    /// Applies to the flight in progress, or to the next one if none is.
    /// Every flight gets a new token once it ends, so a handle taken before
    /// a flight has no effect on later flights.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Index of the step being (or last) executed
    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    pub fn session(&self) -> &FlightSession {
        &self.session
    }

    /// Fly `plan` from connect to disconnect
    pub async fn run(&mut self, plan: &FlightPlan) -> FlightOutcome {
        let outcome = self.fly(plan).await;
        self.abort = CancellationToken::new();
        outcome
    }

    async fn fly(&mut self, plan: &FlightPlan) -> FlightOutcome {
        self.state = SequencerState::NotConnected;
        self.current_step = None;

        if !self.session.connect(self.connect_options).await {
            error!("Could not connect to vehicle, flight cancelled");
            return FlightOutcome::ConnectFailed;
        }
        info!("Starting flight {}", self.session.run_id());

        self.report_battery().await;

        if let Err(cause) = self.countdown(plan.countdown).await {
            let first = plan.steps.first().map_or("countdown", |s| s.name.as_str());
            return self.abort_to_land(plan, first, cause).await;
        }

        for (index, step) in plan.steps.iter().enumerate() {
            self.current_step = Some(index);

            if let Err(cause) = self.execute(step).await {
                return self.abort_to_land(plan, &step.name, cause).await;
            }
            if let Err(cause) = self.dwell(step.dwell).await {
                return self.abort_to_land(plan, &step.name, cause).await;
            }
        }

        let landed = self.land(&plan.land).await;
        if landed {
            self.state = SequencerState::Landed;
        }

        self.session.disconnect().await;
        self.state = SequencerState::Disconnected;

        if landed {
            info!("Flight complete");
            FlightOutcome::Landed
        } else {
            warn!("Flight complete but landing was not confirmed");
            FlightOutcome::LandedWithWarning
        }
    }

    async fn report_battery(&self) {
        let read_timeout = self.session.read_timeout();
        let direct = timeout(read_timeout, self.session.state(StateMessage::BatteryState))
            .await
            .ok()
            .and_then(|r| r.ok().flatten())
            .and_then(|s| s.get(fields::PERCENT));

        let pct = match direct {
            Some(pct) => Some(pct),
            None => timeout(read_timeout, self.session.state(StateMessage::BatteryCapacity))
                .await
                .ok()
                .and_then(|r| r.ok().flatten())
                .and_then(|s| match (s.get(fields::FULL_CHARGE), s.get(fields::REMAINING)) {
                    (Some(full), Some(remaining)) if full > 0.0 && remaining >= 0.0 => Some(100.0 * remaining / full),
                    _ => None,
                }),
        };

        match pct {
            Some(pct) => info!("Battery: {:.0}%", pct),
            None => warn!("Battery level unavailable"),
        }
    }

    async fn countdown(&self, duration: Duration) -> Result<(), StepFailure> {
        let secs = duration.as_secs();
        for remaining in (1..=secs).rev() {
            info!("Take-off in {}...", remaining);
            self.dwell(Duration::from_secs(1)).await?;
        }
        Ok(())
    }

    /// Sleep unless an abort is requested first
    async fn dwell(&self, duration: Duration) -> Result<(), StepFailure> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(StepFailure::Aborted),
            _ = sleep(duration) => Ok(()),
        }
    }

    async fn execute(&mut self, step: &CommandStep) -> Result<(), StepFailure> {
        info!("{}: {}", step.name, step.command);
        if matches!(step.command, Command::MoveBy { .. }) {
            self.state = SequencerState::Moving;
        }

        let result = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(StepFailure::Aborted),
            result = timeout(step.timeout, self.session.forward(step.command, step.expect)) => result,
        };

        let outcome = result
            .map_err(|_| StepFailure::Timeout(step.timeout))?
            .map_err(|e| StepFailure::Link(e.to_string()))?;

        if !outcome.success() {
            return Err(StepFailure::Rejected(outcome.state()));
        }
        if outcome.state() != step.expect {
            return Err(StepFailure::UnexpectedState {
                expected: step.expect,
                actual: outcome.state(),
            });
        }

        if step.expect == FlyingState::Hovering {
            self.state = SequencerState::Hovering;
        }
        Ok(())
    }

    /// Issue a landing, returning whether the vehicle confirmed it is down
    ///
    /// Not abortable: landing is where an abort leads anyway.
    async fn land(&self, step: &CommandStep) -> bool {
        info!("{}: {}", step.name, step.command);
        match timeout(step.timeout, self.session.forward(step.command, step.expect)).await {
            Ok(Ok(outcome)) if outcome.state() == step.expect => true,
            Ok(Ok(outcome)) => {
                warn!("{} not confirmed, vehicle reported {}", step.name, outcome.state());
                false
            }
            Ok(Err(e)) => {
                warn!("{} failed: {}", step.name, e);
                false
            }
            Err(_) => {
                warn!("{} timed out after {:?}", step.name, step.timeout);
                false
            }
        }
    }

    async fn abort_to_land(&mut self, plan: &FlightPlan, step: &str, cause: StepFailure) -> FlightOutcome {
        self.state = SequencerState::Aborted;
        error!("Step '{}' failed: {}. Landing now.", step, cause);

        let recovery_landed = self.land(&plan.recovery_land).await;
        if !recovery_landed {
            error!("Recovery landing not confirmed, vehicle may still be airborne");
        }

        self.session.disconnect().await;

        FlightOutcome::StepFailed {
            step: step.to_string(),
            cause,
            recovery_landed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::telemetry::{FlightLog, TelemetryReader};
    use crate::vehicle::mocks::{Call, Reply, ScriptedVehicle, StateReply};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn fast_plan() -> FlightPlan {
        let config = FlightConfig {
            countdown_s: 0,
            hover_ms: 5,
            hold_ms: 5,
            pre_land_ms: 5,
            ..FlightConfig::default()
        };
        let mut plan = FlightPlan::out_and_back(&config);
        for step in &mut plan.steps {
            step.timeout = Duration::from_millis(150);
        }
        plan.land.timeout = Duration::from_millis(150);
        plan.recovery_land.timeout = Duration::from_millis(150);
        plan
    }

    fn sequencer(vehicle: &ScriptedVehicle, dir: &TempDir) -> Sequencer {
        let session = FlightSession::new(
            Arc::new(vehicle.clone()),
            FlightLog::new(dir.path().join("flight_log.csv")),
            TelemetryReader::new(1, Duration::ZERO, Duration::from_millis(50)),
            SessionConfig {
                settle_ms: 0,
                sample_interval_ms: 20,
                join_timeout_ms: 500,
            },
        );
        Sequencer::new(session, ConnectOptions::default())
    }

    #[test]
    fn test_out_and_back_plan() {
        let plan = FlightPlan::out_and_back(&FlightConfig::default());

        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["take_off", "move_forward", "move_backward"]);
        assert_eq!(plan.countdown, Duration::from_secs(5));

        assert_eq!(plan.steps[0].timeout, Duration::from_secs(15));
        assert_eq!(plan.steps[0].dwell, Duration::from_secs(2));
        assert_eq!(plan.steps[1].command, Command::forward(5.0));
        assert_eq!(plan.steps[1].timeout, Duration::from_secs(25));
        assert_eq!(plan.steps[1].dwell, Duration::from_secs(3));
        assert_eq!(plan.steps[2].command, Command::forward(-5.0));
        assert_eq!(plan.steps[2].dwell, Duration::from_secs(2));

        assert_eq!(plan.land.timeout, Duration::from_secs(15));
        assert_eq!(plan.recovery_land.timeout, Duration::from_secs(10));
        assert_eq!(plan.recovery_land.expect, FlyingState::Landed);
    }

    #[tokio::test]
    async fn test_nominal_flight() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert_eq!(outcome, FlightOutcome::Landed);
        assert_eq!(sequencer.state(), SequencerState::Disconnected);
        assert_eq!(sequencer.current_step(), Some(2));
        assert_eq!(
            vehicle.commands(),
            vec![Command::TakeOff, Command::forward(5.0), Command::forward(-5.0), Command::Land]
        );
        assert_eq!(vehicle.calls().first(), Some(&Call::Connect));
        assert_eq!(vehicle.calls().last(), Some(&Call::Disconnect));
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_flies_nothing() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_connect_result(false);
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert_eq!(outcome, FlightOutcome::ConnectFailed);
        assert_eq!(sequencer.state(), SequencerState::NotConnected);
        assert_eq!(vehicle.calls(), vec![Call::Connect]);
        assert!(!dir.path().join("flight_log.csv").exists());
    }

    #[tokio::test]
    async fn test_move_timeout_lands_once() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_reply("move_forward", Reply::Stall);
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert_eq!(
            outcome,
            FlightOutcome::StepFailed {
                step: "move_forward".to_string(),
                cause: StepFailure::Timeout(Duration::from_millis(150)),
                recovery_landed: true,
            }
        );
        assert_eq!(sequencer.state(), SequencerState::Aborted);
        // The backward move is never attempted
        assert_eq!(
            vehicle.commands(),
            vec![Command::TakeOff, Command::forward(5.0), Command::Land]
        );
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
        assert_eq!(vehicle.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_rejected_takeoff() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_reply("take_off", Reply::Reject);
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert!(matches!(
            outcome,
            FlightOutcome::StepFailed { ref step, cause: StepFailure::Rejected(_), recovery_landed: true }
                if step == "take_off"
        ));
        assert_eq!(vehicle.commands(), vec![Command::TakeOff, Command::Land]);
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_unexpected_terminal_state() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_reply("move_backward", Reply::WrongState(FlyingState::Flying));
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert_eq!(
            outcome,
            FlightOutcome::StepFailed {
                step: "move_backward".to_string(),
                cause: StepFailure::UnexpectedState {
                    expected: FlyingState::Hovering,
                    actual: FlyingState::Flying,
                },
                recovery_landed: true,
            }
        );
        assert_eq!(vehicle.count(&Call::Execute(Command::Land)), 1);
    }

    #[tokio::test]
    async fn test_link_error() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_reply("take_off", Reply::LinkError);
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert!(matches!(
            outcome,
            FlightOutcome::StepFailed { cause: StepFailure::Link(_), .. }
        ));
        assert_eq!(vehicle.count(&Call::Execute(Command::Land)), 1);
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_failed_recovery_landing_reported() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_reply("move_forward", Reply::Reject);
        vehicle.set_reply("land", Reply::Stall);
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert!(matches!(
            outcome,
            FlightOutcome::StepFailed { recovery_landed: false, .. }
        ));
        // Still exactly one landing attempt, and the link is closed
        assert_eq!(vehicle.count(&Call::Execute(Command::Land)), 1);
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_landing_is_a_warning() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_reply("land", Reply::Reject);
        let mut sequencer = sequencer(&vehicle, &dir);

        let outcome = sequencer.run(&fast_plan()).await;

        assert_eq!(outcome, FlightOutcome::LandedWithWarning);
        assert!(!outcome.is_landed());
        assert_eq!(vehicle.count(&Call::Execute(Command::Land)), 1);
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
        assert_eq!(sequencer.state(), SequencerState::Disconnected);
    }

    #[tokio::test]
    async fn test_abort_during_countdown() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        let mut sequencer = sequencer(&vehicle, &dir);
        let mut plan = fast_plan();
        plan.countdown = Duration::from_secs(5);

        sequencer.abort_handle().cancel();
        let outcome = sequencer.run(&plan).await;

        assert_eq!(
            outcome,
            FlightOutcome::StepFailed {
                step: "take_off".to_string(),
                cause: StepFailure::Aborted,
                recovery_landed: true,
            }
        );
        assert_eq!(vehicle.commands(), vec![Command::Land]);
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_abort_during_hold() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        let mut sequencer = sequencer(&vehicle, &dir);
        let mut plan = fast_plan();
        plan.steps[1].dwell = Duration::from_secs(30);

        let abort = sequencer.abort_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            abort.cancel();
        });

        let outcome = sequencer.run(&plan).await;

        assert_eq!(
            outcome,
            FlightOutcome::StepFailed {
                step: "move_forward".to_string(),
                cause: StepFailure::Aborted,
                recovery_landed: true,
            }
        );
        assert_eq!(
            vehicle.commands(),
            vec![Command::TakeOff, Command::forward(5.0), Command::Land]
        );
        assert_eq!(vehicle.count(&Call::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_abort_only_ends_current_flight() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        let mut sequencer = sequencer(&vehicle, &dir);
        let mut plan = fast_plan();
        plan.countdown = Duration::from_secs(5);

        let abort = sequencer.abort_handle();
        abort.cancel();
        assert!(matches!(
            sequencer.run(&plan).await,
            FlightOutcome::StepFailed { cause: StepFailure::Aborted, .. }
        ));

        // The next flight runs to completion despite the earlier abort
        assert!(!sequencer.abort_handle().is_cancelled());
        assert_eq!(sequencer.run(&fast_plan()).await, FlightOutcome::Landed);
        assert_eq!(
            vehicle.commands(),
            vec![
                Command::Land,
                Command::TakeOff,
                Command::forward(5.0),
                Command::forward(-5.0),
                Command::Land,
            ]
        );
        assert_eq!(vehicle.count(&Call::Disconnect), 2);
    }

    #[tokio::test]
    async fn test_stalled_battery_report_bounded_by_read_timeout() {
        let dir = tempdir().unwrap();
        let vehicle = ScriptedVehicle::with_telemetry();
        vehicle.set_state(StateMessage::BatteryState, StateReply::Stall);
        vehicle.set_state(StateMessage::BatteryCapacity, StateReply::Stall);
        let mut sequencer = sequencer(&vehicle, &dir);

        let started = tokio::time::Instant::now();
        let outcome = sequencer.run(&fast_plan()).await;

        assert_eq!(outcome, FlightOutcome::Landed);
        // Both battery queries give up after the 50 ms read timeout
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_outcome_display() {
        let outcome = FlightOutcome::StepFailed {
            step: "move_forward".to_string(),
            cause: StepFailure::Timeout(Duration::from_secs(25)),
            recovery_landed: true,
        };
        assert_eq!(
            outcome.to_string(),
            "step 'move_forward' failed (timed out after 25s), recovery landing confirmed"
        );
        assert_eq!(FlightOutcome::Landed.to_string(), "landed");
        assert!(FlightOutcome::Landed.is_landed());
    }
}
