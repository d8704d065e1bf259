//! # Flight Supervisor
//!
//! Flies one out-and-back mission with continuous telemetry logging.
//!
//! The binary loads its configuration, connects to the vehicle, runs the
//! take-off / move / return / land sequence and exits non-zero unless the
//! vehicle confirmed a nominal landing.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flight_supervisor::config::{Config, LoggingConfig};
use flight_supervisor::sequencer::{FlightPlan, Sequencer};
use flight_supervisor::session::FlightSession;
use flight_supervisor::telemetry::{FlightLog, TelemetryReader};
use flight_supervisor::vehicle::sim::{SimProfile, SimulatedVehicle};
use flight_supervisor::vehicle::Vehicle;

/// Environment variable overriding the configuration file path
const CONFIG_ENV: &str = "FLIGHT_SUPERVISOR_CONFIG";

/// Configuration file used when the environment does not name one
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Main entry point
///
/// # Control Flow
///
/// 1. Load configuration (built-in defaults when the file is absent)
/// 2. Set up logging to stdout, plus a log file if configured
/// 3. Build the session and the out-and-back plan
/// 4. Fly it, with Ctrl+C requesting an abort-to-land
///
/// # Errors
///
/// Returns error if:
/// - The configuration file exists but is invalid
/// - The flight log cannot be created
/// - The flight did not end with a confirmed landing
///
/// # Examples
///
/// ```bash
/// FLIGHT_SUPERVISOR_CONFIG=config/default.toml cargo run --release
/// ```
///
/// Expected output:
/// ```text
/// INFO flight_supervisor: Flight Supervisor v0.1.0 starting...
/// INFO flight_supervisor::session: Connecting to vehicle (run 20260314_100000)
/// INFO flight_supervisor::sequencer: Battery: 85%
/// INFO flight_supervisor::sequencer: Take-off in 5...
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _guard = init_logging(&config.logging)?;

    info!("Flight Supervisor v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Vehicle: {} (simulated link)", config.vehicle.address);

    let log = FlightLog::new(&config.telemetry.log_path);
    log.ensure_initialized()
        .with_context(|| format!("Failed to create flight log {}", config.telemetry.log_path))?;
    info!("Telemetry logged to {}", log.path().display());

    let vehicle: Arc<dyn Vehicle> = Arc::new(SimulatedVehicle::new(SimProfile::default()));
    let session = FlightSession::new(
        vehicle,
        log,
        TelemetryReader::from_config(&config.telemetry),
        config.session.clone(),
    );
    let plan = FlightPlan::out_and_back(&config.flight);
    let mut sequencer = Sequencer::new(session, config.vehicle.connect_options());

    let abort = sequencer.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, aborting flight");
            abort.cancel();
        }
    });

    let outcome = sequencer.run(&plan).await;
    let run_id = sequencer.session().run_id().clone();
    info!("Flight {} finished: {}", run_id, outcome);

    anyhow::ensure!(outcome.is_landed(), "Flight {} did not complete: {}", run_id, outcome);
    Ok(())
}

/// Initialize tracing to stdout and, if configured, to a log file
///
/// The returned guard must be held until exit so buffered file output is flushed.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let (file_layer, guard) = if config.file.is_empty() {
        (None, None)
    } else {
        let path = std::path::Path::new(&config.file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
        let name = path
            .file_name()
            .with_context(|| format!("Invalid log file path {}", config.file))?;

        let appender = tracing_appender::rolling::never(dir, name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // No colors in the file
        let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}
