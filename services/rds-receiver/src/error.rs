//! Receiver error taxonomy

use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceOwner, ReceiverMode};

/// Errors surfaced by process supervision, arbitration and search
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The command could not be launched at all
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command launched but lost the hardware claim during startup
    #[error("device busy: `{command}` reported `{marker}`")]
    DeviceBusy { command: String, marker: String },

    /// A decoder line could not be parsed (absorbed by the listen loops)
    #[error("malformed decoder output: {0}")]
    MalformedOutput(String),

    /// Graceful stop did not finish within the grace period
    #[error("`{command}` did not exit within {grace:?} of SIGTERM")]
    TerminationTimeout { command: String, grace: Duration },

    /// The receiver is already held by someone else
    #[error("receiver is held by {held_by}; {requested} cannot acquire it")]
    ExclusivityViolation {
        requested: DeviceOwner,
        held_by: DeviceOwner,
    },

    #[error("sweep did not finish within {0:?}")]
    SweepTimeout(Duration),

    #[error("sweep produced no power samples")]
    EmptySweep,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} is not available in {mode} mode")]
    WrongMode {
        operation: &'static str,
        mode: ReceiverMode,
    },

    #[error("unknown DAB channel `{0}`")]
    UnknownChannel(String),

    #[error("unknown DAB service `{0}` in the current ensemble")]
    UnknownService(String),

    /// The welle-cli web API failed or returned something unusable
    #[error("welle-cli API request to {url} failed: {source}")]
    DigitalApi {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A command needs a running digital receiver
    #[error("digital receiver is not running")]
    DigitalNotRunning,

    #[error("invalid frequency {0} MHz")]
    InvalidFrequency(f64),

    #[error("receiver controller has shut down")]
    ControllerClosed,
}

impl ReceiverError {
    /// Whether a spawn attempt that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::DeviceBusy { .. })
    }
}

pub type Result<T, E = ReceiverError> = std::result::Result<T, E>;
