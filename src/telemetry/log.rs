//! Append-only CSV flight log
//!
//! The file accumulates records from every session ever run against the same
//! path. It is never truncated or rewritten; the header is written exactly
//! once, when the file is first created (or found empty).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::TelemetryRecord;
use crate::error::Result;

/// Column names, in file order
pub const CSV_HEADERS: [&str; 10] = [
    "timestamp",
    "run_id",
    "phase",
    "latitude",
    "longitude",
    "altitude_m",
    "altitude_above_takeoff_m",
    "battery_pct",
    "battery_remaining_mah",
    "battery_full_mah",
];

/// Flight log file handle
#[derive(Debug, Clone)]
pub struct FlightLog {
    path: PathBuf,
}

impl FlightLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with its header row if it does not exist or is empty
    ///
    /// Existing content is left untouched. Calling this repeatedly is harmless.
    pub fn ensure_initialized(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let needs_header = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        if needs_header {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(format!("{}\n", CSV_HEADERS.join(",")).as_bytes())?;
            file.sync_data()?;
            info!("Created flight log at {}", self.path.display());
        }

        Ok(())
    }

    /// Append one record and flush it to disk before returning
    pub fn append(&self, record: &TelemetryRecord) -> Result<()> {
        self.ensure_initialized()?;

        let line = record
            .columns()
            .iter()
            .map(|c| escape(c))
            .collect::<Vec<_>>()
            .join(",");

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        // Single write so a record never interleaves with another writer's
        file.write_all(format!("{}\n", line).as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

/// Quote a field if it contains a delimiter, quote or line break
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
