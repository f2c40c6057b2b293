//! Error taxonomy for the monitor core.
//!
//! Every variant is scoped to a single plant, command, or reconcile tick.
//! None of them stop the telemetry loop or the command router.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The sensor could not be read. Surfaces as an "unknown" reading.
    #[error("sensor channel {channel} unavailable: {reason}")]
    SensorUnavailable { channel: u8, reason: String },

    /// The pump dose failed. Fatal for the command that requested it.
    #[error("pump channel {channel} failed: {reason}")]
    ActuationFailure { channel: u8, reason: String },

    /// A dose is already running for this plant.
    #[error("pump for '{plant}' is already dosing")]
    PumpBusy { plant: String },

    #[error("invalid dose duration {0}s")]
    InvalidDuration(f64),

    /// The threshold store could not be read or written.
    #[error("threshold store {} unreadable: {source}", .path.display())]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A threshold write that cannot be stored as a single `KEY=value` line.
    #[error("cannot store {key}: {reason}")]
    InvalidThreshold { key: String, reason: String },

    /// Unparsable payload or unknown topic.
    #[error("malformed command on '{topic}': {reason}")]
    MalformedCommand { topic: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MonitorError>;
