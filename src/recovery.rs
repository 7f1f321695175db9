//! Corrective actions for device faults.
//!
//! Underruns are fixed with `prepare`. Suspends are resumed with a bounded
//! retry loop, falling back to `prepare` when resuming keeps failing. Anything
//! else is fatal.

use core::time::Duration;
use std::thread;

use tracing::{debug, warn};

use crate::device::DeviceSession;
use crate::error::{DeviceError, PumpError, Result};

/// Retry policy for suspended devices.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RecoveryConfig {
    /// `resume` calls allowed after the first one answers "try again"
    pub resume_retries: u32,
    /// Sleep between two `resume` calls
    pub resume_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            resume_retries: 10,
            resume_backoff: Duration::from_secs(1),
        }
    }
}

impl RecoveryConfig {
    pub fn with_resume_retries(mut self, retries: u32) -> Self {
        self.resume_retries = retries;
        self
    }

    pub fn with_resume_backoff(mut self, backoff: Duration) -> Self {
        self.resume_backoff = backoff;
        self
    }
}

/// A device fault that recovery knows how to handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Fault {
    Underrun,
    Suspended,
}

impl Fault {
    /// Sorts a device error into a recoverable fault, or `None` if it is fatal.
    pub fn classify(err: &DeviceError) -> Option<Fault> {
        match err {
            DeviceError::Underrun | DeviceError::ShortCommit { .. } => Some(Fault::Underrun),
            DeviceError::Suspended => Some(Fault::Suspended),
            _ => None,
        }
    }
}

impl From<Fault> for PumpError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Underrun => PumpError::Underrun,
            Fault::Suspended => PumpError::Suspended,
        }
    }
}

/// How a fault was cleared.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Recovered {
    /// Ring reset after an underrun; the device is prepared and needs a restart
    Prepared,
    /// Device resumed where it left off after `retries` extra attempts
    Resumed { retries: u32 },
    /// Resume gave up; the ring was reset instead
    PreparedAfterSuspend,
}

impl Recovered {
    /// Whether the device was left prepared and must be started again.
    pub fn needs_start(self) -> bool {
        !matches!(self, Recovered::Resumed { .. })
    }
}

/// Clears `fault` on `device`, sleeping between resume attempts.
///
/// Fails with [`PumpError::Unrecoverable`] when the corrective action itself
/// fails.
pub fn recover<D: DeviceSession + ?Sized>(device: &mut D, fault: Fault, config: &RecoveryConfig) -> Result<Recovered> {
    recover_with(device, fault, config, |backoff| {
        thread::sleep(backoff);
        true
    })
}

/// Like [`recover`], but waits out each resume backoff with `wait`.
///
/// `wait` returns `false` to abandon the recovery. The fault is then left in
/// place and returned as [`PumpError::Underrun`] or [`PumpError::Suspended`].
pub fn recover_with<D, W>(device: &mut D, fault: Fault, config: &RecoveryConfig, mut wait: W) -> Result<Recovered>
where
    D: DeviceSession + ?Sized,
    W: FnMut(Duration) -> bool,
{
    match fault {
        Fault::Underrun => {
            warn!("underrun, preparing device");
            device.prepare().map_err(PumpError::Unrecoverable)?;
            Ok(Recovered::Prepared)
        }
        Fault::Suspended => {
            warn!("device suspended, resuming");
            let mut retries = 0;
            loop {
                match device.resume() {
                    Ok(()) => {
                        debug!("resumed after {retries} retries");
                        return Ok(Recovered::Resumed { retries });
                    }
                    Err(DeviceError::TryAgain) if retries < config.resume_retries => {
                        retries += 1;
                        if !wait(config.resume_backoff) {
                            debug!("resume abandoned after {retries} attempts");
                            return Err(fault.into());
                        }
                    }
                    Err(err) => {
                        warn!("resume failed after {retries} retries ({err}), preparing device");
                        break;
                    }
                }
            }
            device.prepare().map_err(PumpError::Unrecoverable)?;
            Ok(Recovered::PreparedAfterSuspend)
        }
    }
}
