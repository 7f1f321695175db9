//! Session configuration.

use core::time::Duration;

use crate::error::{PumpError, Result};
use crate::format::{Layout, StreamFormat};
use crate::recovery::RecoveryConfig;
use crate::ring::AccessMode;
use crate::tone::ToneGenerator;

/// What wakes the pump when buffer space opens up.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum WakeMode {
    /// The device calls the fill logic from its own context
    Callback,
    /// Sleep half a period, then poll free space
    Poll,
    /// Block on the device's period event
    #[default]
    Event,
}

/// Everything needed to open a device and run a pump on it.
///
/// ```
/// use std::time::Duration;
/// use tonepump::{SessionConfig, ToneGenerator, WakeMode};
///
/// let config = SessionConfig::default()
///     .with_wake(WakeMode::Poll)
///     .with_period_time(Duration::from_millis(20))
///     .with_tone(ToneGenerator::new(440.0).with_amplitude(0.5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Output device name; `None` picks the system default
    pub device: Option<String>,
    pub format: StreamFormat,
    pub layout: Layout,
    pub access: AccessMode,
    pub wake: WakeMode,
    /// Requested ring length; the device picks the nearest it supports
    pub buffer_time: Duration,
    /// Requested period length; the device picks the nearest it supports
    pub period_time: Duration,
    pub tone: ToneGenerator,
    pub recovery: RecoveryConfig,
    /// Longest a staged submit may wait for ring space
    pub submit_timeout: Duration,
    /// Stop an event-driven pump once the device stops draining the ring
    pub drain_on_stall: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: None,
            format: StreamFormat::default(),
            layout: Layout::Interleaved,
            access: AccessMode::Mapped,
            wake: WakeMode::Event,
            buffer_time: Duration::from_millis(500),
            period_time: Duration::from_millis(100),
            tone: ToneGenerator::new(110.0).with_amplitude(0.25), // -12dB, safe default
            recovery: RecoveryConfig::default(),
            submit_timeout: Duration::from_secs(1),
            drain_on_stall: false,
        }
    }
}

impl SessionConfig {
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device = Some(name.into());
        self
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn with_wake(mut self, wake: WakeMode) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_buffer_time(mut self, buffer_time: Duration) -> Self {
        self.buffer_time = buffer_time;
        self
    }

    pub fn with_period_time(mut self, period_time: Duration) -> Self {
        self.period_time = period_time;
        self
    }

    pub fn with_tone(mut self, tone: ToneGenerator) -> Self {
        self.tone = tone;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn with_drain_on_stall(mut self, drain: bool) -> Self {
        self.drain_on_stall = drain;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if self.period_time.is_zero() {
            return Err(PumpError::InvalidConfig("period time must be positive".into()));
        }
        if self.buffer_time < self.period_time {
            return Err(PumpError::InvalidConfig(format!(
                "buffer time {:?} is shorter than period time {:?}",
                self.buffer_time, self.period_time
            )));
        }
        Ok(())
    }
}
