use std::fmt;

use thiserror::Error;

use crate::device::types::ReadyState;
use crate::transport::TransportError;

/// Why a pending operation was abandoned early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    DisconnectRequested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => write!(f, "the operation timed out"),
            CancelReason::DisconnectRequested => write!(f, "disconnect requested"),
        }
    }
}

/// Why a pending calibration was rejected before its window filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationAbort {
    Disconnected,
    DeviceChanged,
    Superseded,
}

impl fmt::Display for CalibrationAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationAbort::Disconnected => write!(f, "the session was disconnected"),
            CalibrationAbort::DeviceChanged => write!(f, "a new device was requested"),
            CalibrationAbort::Superseded => write!(f, "superseded by a newer calibration"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No device has been selected; call request_device() first")]
    NoDeviceSelected,

    #[error("A connection is already established or in progress (state: {state:?})")]
    AlreadyActive { state: ReadyState },

    #[error("Cannot request a device right now (state: {state:?})")]
    DeviceRequestUnavailable { state: ReadyState },

    #[error("Not connected (state: {state:?})")]
    NotConnected { state: ReadyState },

    #[error("Device selection failed: {source}")]
    DeviceRequestFailed { source: TransportError },

    #[error("The selected device does not expose a connectable transport")]
    NotConnectable,

    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        source: TransportError,
    },

    #[error("Failed to decode breath frame: {detail}")]
    MalformedFrame { detail: String },

    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("Calibration aborted: {reason}")]
    CalibrationAborted { reason: CalibrationAbort },

    #[error("Tick fired without an active device session (state: {state:?})")]
    UnexpectedTick { state: ReadyState },
}

impl SessionError {
    /// Whether this error is the distinguished cancellation kind (timeout
    /// or explicit disconnect), directly or as the underlying cause.
    pub fn is_cancellation(&self) -> bool {
        match self {
            SessionError::Cancelled { .. } => true,
            SessionError::Transport { source, .. } => source
                .downcast_ref::<SessionError>()
                .is_some_and(SessionError::is_cancellation),
            _ => false,
        }
    }
}
