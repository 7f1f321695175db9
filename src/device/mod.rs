//! Device sessions: the endpoint the pump writes into.
//!
//! A session owns the negotiated [`StreamFormat`] and [`BufferGeometry`], the
//! device ring (through [`RingBufferAdapter`]) and the device state machine.
//! Two sessions ship with the crate:
//! - [`SimDevice`], an in-memory device driven by hand through a [`SimClock`]
//! - [`CpalSession`] (feature `cpal_sink`), a real output device through cpal

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::SessionConfig;
use crate::error::{DeviceError, PumpError, Result};
use crate::event::PeriodEvent;
use crate::format::{BufferGeometry, SampleFormat, StreamFormat};
use crate::ring::RingBufferAdapter;

pub(crate) mod pcm;
mod sim;
#[cfg(feature = "cpal_sink")]
mod cpal_backend;

pub use sim::{ResumeOutcome, SimClock, SimDevice};
#[cfg(feature = "cpal_sink")]
pub use cpal_backend::CpalSession;

/// State reported by a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum DeviceState {
    /// Open, nothing configured to play
    Idle,
    /// Ready to start; pointers reset
    Prepared,
    /// Consuming frames
    Running,
    /// Ran out of frames while running
    Underrun,
    /// Stopped by the system; needs `resume` or `prepare`
    Suspended,
    /// Gone for good
    Disconnected,
}

impl DeviceState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => DeviceState::Idle,
            1 => DeviceState::Prepared,
            2 => DeviceState::Running,
            3 => DeviceState::Underrun,
            4 => DeviceState::Suspended,
            _ => DeviceState::Disconnected,
        }
    }

    /// The error a ring access reports in this state, if any.
    pub fn fault(self) -> Option<DeviceError> {
        match self {
            DeviceState::Underrun => Some(DeviceError::Underrun),
            DeviceState::Suspended => Some(DeviceError::Suspended),
            DeviceState::Disconnected => Some(DeviceError::Disconnected("device removed".into())),
            _ => None,
        }
    }
}

/// Fill logic invoked by the device itself whenever buffer space opens up.
///
/// Runs on the device's consumer context (the audio callback thread for
/// [`CpalSession`], the caller of [`SimClock::advance`] for [`SimDevice`]).
/// Invocations never overlap. The handler must not register or remove
/// handlers on the device it is given.
pub trait BufferReadyHandler: Send {
    fn buffer_ready(&mut self, device: &mut dyn DeviceSession) -> Result<()>;
}

/// An open, configured audio endpoint.
///
/// Implementations negotiate their geometry when opened; callers must use
/// [`geometry`](Self::geometry) rather than the requested times.
pub trait DeviceSession: RingBufferAdapter + Send {
    fn format(&self) -> &StreamFormat;

    fn geometry(&self) -> BufferGeometry;

    fn state(&self) -> DeviceState;

    /// Frames that can be written without overwriting unplayed audio.
    fn available_frames(&mut self) -> Result<usize, DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stops playback and drops queued frames, leaving the device prepared.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Resets the ring after an underrun; the device ends up prepared.
    fn prepare(&mut self) -> Result<(), DeviceError>;

    /// Leaves the suspended state. Returns [`DeviceError::TryAgain`] while the
    /// system is not ready yet.
    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Event signalled once per period boundary and on every fault.
    fn period_event(&self) -> Arc<PeriodEvent>;

    fn set_buffer_ready_handler(&mut self, handler: Box<dyn BufferReadyHandler>) -> Result<(), DeviceError>;

    fn take_buffer_ready_handler(&mut self) -> Option<Box<dyn BufferReadyHandler>>;

    /// Error that made the registered handler give up, if any.
    fn take_handler_error(&mut self) -> Option<PumpError>;
}

/// What an endpoint accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub sample_formats: Vec<SampleFormat>,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub max_channels: u16,
    pub min_period_frames: usize,
    pub max_period_frames: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sample_formats: vec![
                SampleFormat::U8,
                SampleFormat::S16,
                SampleFormat::S24,
                SampleFormat::S32,
                SampleFormat::F32,
            ],
            min_sample_rate: 8_000,
            max_sample_rate: 192_000,
            max_channels: 8,
            min_period_frames: 16,
            max_period_frames: 1 << 16,
        }
    }
}

/// Picks the geometry nearest to the requested times that `caps` allows.
///
/// The format itself is not adjusted: an unsupported sample format, rate or
/// channel count is rejected.
pub(crate) fn negotiate(caps: &Capabilities, config: &SessionConfig) -> Result<(StreamFormat, BufferGeometry)> {
    config.validate()?;
    let format = config.format;

    if !caps.sample_formats.contains(&format.sample_format) {
        return Err(PumpError::ConfigurationUnsupported(format!(
            "sample format {:?} not available",
            format.sample_format
        )));
    }
    if format.sample_rate < caps.min_sample_rate || format.sample_rate > caps.max_sample_rate {
        return Err(PumpError::ConfigurationUnsupported(format!(
            "rate {}Hz outside {}..={}Hz",
            format.sample_rate, caps.min_sample_rate, caps.max_sample_rate
        )));
    }
    if format.channels > caps.max_channels {
        return Err(PumpError::ConfigurationUnsupported(format!(
            "{} channels requested, device has {}",
            format.channels, caps.max_channels
        )));
    }
    if caps.min_period_frames > caps.max_period_frames {
        return Err(PumpError::ConfigurationUnsupported("device reports no usable period size".into()));
    }

    let period_frames = format
        .frames_for(config.period_time)
        .clamp(caps.min_period_frames.max(1), caps.max_period_frames);
    let periods = (config.buffer_time.as_secs_f64() / config.period_time.as_secs_f64())
        .round()
        .max(2.0) as usize;

    let buffer_frames = periods.checked_mul(period_frames).ok_or_else(|| {
        PumpError::ConfigurationUnsupported(format!("buffer of {periods} periods of {period_frames} frames is too large"))
    })?;

    let geometry = BufferGeometry::new(buffer_frames, period_frames)?;
    Ok((format, geometry))
}
