//! # Error Types
//!
//! Custom error types for the flight supervisor using `thiserror`.

use thiserror::Error;

/// Main error type for the flight supervisor
#[derive(Debug, Error)]
pub enum FlightSupervisorError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors (flight log store, config file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The vehicle link reported a fault
    #[error("Vehicle error: {0}")]
    Vehicle(String),
}

/// Result type alias for the flight supervisor
pub type Result<T> = std::result::Result<T, FlightSupervisorError>;
