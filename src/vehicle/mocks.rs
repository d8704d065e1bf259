//! Scriptable vehicle for testing session and sequencer behavior

use super::*;
use crate::error::FlightSupervisorError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One call observed by [`ScriptedVehicle`], in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Disconnect,
    Execute(Command),
    State(StateMessage),
}

/// How the vehicle answers a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Reach the expected state
    Complete,
    /// Report non-success
    Reject,
    /// Report success but settle in another state
    WrongState(FlyingState),
    /// Never answer
    Stall,
    /// Transport fault
    LinkError,
}

/// How the vehicle answers a state query
#[derive(Debug, Clone, PartialEq)]
pub enum StateReply {
    Snapshot(StateSnapshot),
    Missing,
    Fail,
    Stall,
}

/// Identifies which command a [`Reply`] applies to
pub fn command_key(command: &Command) -> &'static str {
    match command {
        Command::TakeOff => "take_off",
        Command::Land => "land",
        Command::MoveBy { dx, .. } if *dx >= 0.0 => "move_forward",
        Command::MoveBy { .. } => "move_backward",
    }
}

/// Mock vehicle that records every call and answers from a script
#[derive(Clone)]
pub struct ScriptedVehicle {
    pub journal: Arc<Mutex<Vec<Call>>>,
    pub connect_result: Arc<Mutex<bool>>,
    pub replies: Arc<Mutex<HashMap<&'static str, Reply>>>,
    pub states: Arc<Mutex<HashMap<StateMessage, StateReply>>>,
}

impl ScriptedVehicle {
    /// A vehicle that connects, completes every command and has no state yet
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            connect_result: Arc::new(Mutex::new(true)),
            replies: Arc::new(Mutex::new(HashMap::new())),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A vehicle with a GPS fix and a battery reading, so samples finish in one attempt
    pub fn with_telemetry() -> Self {
        let vehicle = Self::new();
        vehicle.set_state(
            StateMessage::GpsLocation,
            StateReply::Snapshot(
                StateSnapshot::new()
                    .with(fields::LATITUDE, 48.878_5)
                    .with(fields::LONGITUDE, 2.367_5)
                    .with(fields::ALTITUDE, 35.2),
            ),
        );
        vehicle.set_state(
            StateMessage::Altitude,
            StateReply::Snapshot(StateSnapshot::new().with(fields::ALTITUDE, 1.05)),
        );
        vehicle.set_state(
            StateMessage::BatteryState,
            StateReply::Snapshot(StateSnapshot::new().with(fields::PERCENT, 87.0)),
        );
        vehicle
    }

    pub fn set_connect_result(&self, result: bool) {
        *self.connect_result.lock().unwrap() = result;
    }

    pub fn set_reply(&self, key: &'static str, reply: Reply) {
        self.replies.lock().unwrap().insert(key, reply);
    }

    pub fn set_state(&self, message: StateMessage, reply: StateReply) {
        self.states.lock().unwrap().insert(message, reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.lock().unwrap().clone()
    }

    /// Commands issued, in order
    pub fn commands(&self) -> Vec<Command> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Execute(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    fn record(&self, call: Call) {
        self.journal.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Vehicle for ScriptedVehicle {
    async fn connect(&self, _options: ConnectOptions) -> Result<bool> {
        self.record(Call::Connect);
        Ok(*self.connect_result.lock().unwrap())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(Call::Disconnect);
        Ok(())
    }

    async fn execute(&self, command: Command, expect: FlyingState) -> Result<CommandOutcome> {
        self.record(Call::Execute(command));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(command_key(&command))
            .copied()
            .unwrap_or(Reply::Complete);

        match reply {
            Reply::Complete => Ok(CommandOutcome::completed(expect)),
            Reply::Reject => Ok(CommandOutcome::failed(FlyingState::Hovering)),
            Reply::WrongState(state) => Ok(CommandOutcome::completed(state)),
            Reply::Stall => std::future::pending().await,
            Reply::LinkError => Err(FlightSupervisorError::Vehicle("link lost".to_string())),
        }
    }

    async fn state(&self, message: StateMessage) -> Result<Option<StateSnapshot>> {
        self.record(Call::State(message));
        let reply = self
            .states
            .lock()
            .unwrap()
            .get(&message)
            .cloned()
            .unwrap_or(StateReply::Missing);

        match reply {
            StateReply::Snapshot(snapshot) => Ok(Some(snapshot)),
            StateReply::Missing => Ok(None),
            StateReply::Fail => Err(FlightSupervisorError::Vehicle(format!("{} unavailable", message))),
            StateReply::Stall => std::future::pending().await,
        }
    }
}
