//! Error types for device sessions and the playback pump.

use thiserror::Error;

use crate::device::DeviceState;

/// Errors reported by a [`DeviceSession`](crate::DeviceSession) or its ring buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device consumed every queued frame before new ones arrived.
    #[error("buffer underrun")]
    Underrun,

    /// The device is suspended (power management, hot unplug in progress, ...).
    #[error("device suspended")]
    Suspended,

    /// The device is not ready yet; the same call may succeed later.
    #[error("device busy, try again")]
    TryAgain,

    /// A commit covered a different number of frames than were granted.
    #[error("short commit: {committed} of {granted} frames")]
    ShortCommit {
        /// Frames handed out by `begin_access`
        granted: usize,
        /// Frames the caller tried to commit
        committed: usize,
    },

    /// The operation is not valid in the device's current state.
    #[error("cannot {op} while device is {state:?}")]
    BadState {
        /// Name of the rejected operation
        op: &'static str,
        /// State the device was in
        state: DeviceState,
    },

    /// The device went away.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// A staged submit could not find room in the ring in time.
    #[error("timed out waiting for ring buffer space")]
    SubmitTimeout,

    /// Error reported by the audio backend.
    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the playback pump to its owner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PumpError {
    /// Format, rate, channel count or period rejected by the device at startup.
    #[error("configuration not supported: {0}")]
    ConfigurationUnsupported(String),

    /// Underrun recovery was abandoned; the device is still faulted.
    #[error("buffer underrun")]
    Underrun,

    /// Resuming was abandoned; the device is still suspended.
    #[error("device suspended")]
    Suspended,

    /// The device failed in a way recovery cannot fix.
    #[error("unrecoverable device error: {0}")]
    Unrecoverable(DeviceError),

    /// The session configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type used throughout the crate.
pub type Result<T, E = PumpError> = core::result::Result<T, E>;
