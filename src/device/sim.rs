//! Deterministic in-memory device.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use delegate::delegate;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::device::pcm::{PcmPort, PcmShared};
use crate::device::{negotiate, BufferReadyHandler, Capabilities, DeviceSession, DeviceState};
use crate::error::{DeviceError, PumpError, Result};
use crate::event::PeriodEvent;
use crate::format::{BufferGeometry, StreamFormat};
use crate::ring::{AccessMode, Region, RingBufferAdapter};

pub use crate::device::pcm::ResumeOutcome;

/// A device whose consumer only moves when told to.
///
/// Time is driven through the [`SimClock`] returned by [`SimDevice::clock`],
/// which can be moved to another thread. Everything the device plays is
/// captured as interleaved bytes.
pub struct SimDevice {
    port: PcmPort,
}

/// Consumer side and fault injection for a [`SimDevice`].
#[derive(Clone)]
pub struct SimClock {
    shared: Arc<PcmShared>,
    played: Arc<Mutex<Vec<u8>>>,
}

impl SimDevice {
    /// Opens a device that accepts any common format.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        Self::open_with(&Capabilities::default(), config)
    }

    pub fn open_with(caps: &Capabilities, config: &SessionConfig) -> Result<Self> {
        let (format, geometry) = negotiate(caps, config)?;
        info!(
            "sim device open: {}Hz {:?} x{}, period {} of {} frames",
            format.sample_rate, format.sample_format, format.channels, geometry.period_frames, geometry.buffer_frames
        );
        let shared = PcmShared::new(format, geometry, config.layout, config.access, config.submit_timeout);
        Ok(Self {
            port: PcmPort::new(shared),
        })
    }

    /// A new consumer handle. Its capture of played audio starts empty.
    pub fn clock(&self) -> SimClock {
        SimClock {
            shared: Arc::clone(self.port.shared()),
            played: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl RingBufferAdapter for SimDevice {
    delegate! {
        to self.port {
            fn access_mode(&self) -> AccessMode;
            fn begin_access(&mut self, frames_requested: usize) -> core::result::Result<Region<'_>, DeviceError>;
            fn commit(&mut self, frames_written: usize) -> core::result::Result<(), DeviceError>;
        }
    }
}

impl DeviceSession for SimDevice {
    delegate! {
        to self.port {
            fn format(&self) -> &StreamFormat;
            fn geometry(&self) -> BufferGeometry;
            fn state(&self) -> DeviceState;
            fn available_frames(&mut self) -> core::result::Result<usize, DeviceError>;
            fn start(&mut self) -> core::result::Result<(), DeviceError>;
            fn stop(&mut self) -> core::result::Result<(), DeviceError>;
            fn prepare(&mut self) -> core::result::Result<(), DeviceError>;
            fn resume(&mut self) -> core::result::Result<(), DeviceError>;
            fn period_event(&self) -> Arc<PeriodEvent>;
            fn set_buffer_ready_handler(&mut self, handler: Box<dyn BufferReadyHandler>) -> core::result::Result<(), DeviceError>;
            fn take_buffer_ready_handler(&mut self) -> Option<Box<dyn BufferReadyHandler>>;
            fn take_handler_error(&mut self) -> Option<PumpError>;
        }
    }
}

impl SimClock {
    /// Lets the device play `frames` frames.
    ///
    /// Runs the registered buffer-ready handler whenever a period boundary
    /// passes. Returns the frames actually taken from the ring; the rest of
    /// the span is captured as silence.
    pub fn advance(&self, frames: usize) -> usize {
        let mut out = vec![0u8; frames * self.shared.format().frame_bytes()];
        let played = self.shared.consume(frames, &mut out);
        self.played.lock().extend_from_slice(&out);
        played
    }

    /// Plays `periods` whole periods, one at a time.
    pub fn advance_periods(&self, periods: usize) -> usize {
        let period = self.shared.geometry().period_frames;
        (0..periods).map(|_| self.advance(period)).sum()
    }

    pub fn inject_underrun(&self) {
        debug!("sim: injecting underrun");
        self.shared.raise(DeviceState::Underrun);
    }

    pub fn inject_suspend(&self) {
        debug!("sim: injecting suspend");
        self.shared.raise(DeviceState::Suspended);
    }

    /// Removes the device; every later operation fails.
    pub fn disconnect(&self) {
        debug!("sim: disconnecting");
        self.shared.raise(DeviceState::Disconnected);
    }

    /// Queues the answers given to upcoming `resume` calls.
    ///
    /// Once the script runs out, `resume` succeeds.
    pub fn script_resume(&self, outcomes: impl IntoIterator<Item = ResumeOutcome>) {
        self.shared.faults.lock().resume_script.extend(outcomes);
    }

    /// Makes the next `prepare` call fail.
    pub fn fail_next_prepare(&self) {
        self.shared.faults.lock().failing_prepares += 1;
    }

    /// Number of `resume` calls seen so far.
    pub fn resume_calls(&self) -> u32 {
        self.shared.faults.lock().resume_calls
    }

    /// Number of `prepare` calls seen so far.
    pub fn prepare_calls(&self) -> u32 {
        self.shared.faults.lock().prepare_calls
    }

    /// Everything played so far, as interleaved bytes.
    pub fn played(&self) -> Vec<u8> {
        self.played.lock().clone()
    }

    pub fn hw_frames(&self) -> u64 {
        self.shared.hw_frames()
    }

    pub fn appl_frames(&self) -> u64 {
        self.shared.appl_frames()
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }
}
