//! tonepump - a low-latency periodic audio buffer pump
//!
//! Keeps a device ring buffer fed with a synthesized sine tone, recovers from
//! underruns and suspends, and wakes up either from a device callback, a
//! half-period poll, or the device's period event.
//!
//! ```
//! use tonepump::{PlaybackPump, SessionConfig, SimDevice};
//!
//! let config = SessionConfig::default();
//! let device = SimDevice::open(&config).unwrap();
//! let clock = device.clock();
//! let (mut pump, _handle) = PlaybackPump::new(device, &config).unwrap();
//!
//! // Two of the five periods are primed before the device starts
//! pump.start().unwrap();
//! clock.advance_periods(1);
//! let wake = pump.service().unwrap();
//! assert_eq!(wake.frames, 4 * 4410);
//! ```

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod format;
pub mod pump;
pub mod recovery;
pub mod ring;
pub mod tone;

pub use config::{SessionConfig, WakeMode};
pub use device::{
    BufferReadyHandler, Capabilities, DeviceSession, DeviceState, ResumeOutcome, SimClock, SimDevice,
};
#[cfg(feature = "cpal_sink")]
pub use device::CpalSession;
pub use error::{DeviceError, PumpError, Result};
pub use event::PeriodEvent;
pub use format::{BufferGeometry, ByteOrder, ChannelArea, Layout, SampleFormat, StreamFormat};
pub use pump::{PlaybackPump, PlaybackState, PumpHandle, PumpReport, StopReason, Wake};
pub use recovery::{recover, recover_with, Fault, Recovered, RecoveryConfig};
pub use ring::{AccessMode, Region, RingBufferAdapter};
pub use tone::{ToneGenerator, ToneMessage, WavePhase};
