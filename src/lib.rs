//! # Flight Supervisor Library
//!
//! Supervise a single scripted flight of a remotely controlled drone.
//!
//! This library provides the control-session wrapper that keeps a telemetry
//! log running for the lifetime of a connection, a fault-tolerant telemetry
//! reader, and a command sequencer that lands the vehicle whenever a step
//! fails.

pub mod config;
pub mod error;
pub mod sequencer;
pub mod session;
pub mod telemetry;
pub mod vehicle;
