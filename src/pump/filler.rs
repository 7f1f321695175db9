//! The fill logic shared by every wake mode.

use alloc::boxed::Box;
use alloc::sync::Arc;

use parking_lot::Mutex;
use rtrb::Consumer;
use tracing::{debug, error, info};

use crate::device::{BufferReadyHandler, DeviceSession};
use crate::error::{DeviceError, PumpError, Result};
use crate::format::{BufferGeometry, StreamFormat};
use crate::pump::{PlaybackState, Status};
use crate::recovery::{recover_with, Fault, RecoveryConfig};
use crate::tone::{ToneGenerator, ToneMessage, WavePhase};

/// What one wake of the pump did.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Wake {
    /// Frames committed during the wake
    pub frames: usize,
    /// Whether the device was started again after a recovery
    pub restarted: bool,
}

impl Wake {
    /// Nothing was written and nothing was restarted.
    pub fn stalled(&self) -> bool {
        self.frames == 0 && !self.restarted
    }
}

pub(crate) struct ToneFiller {
    tone: ToneGenerator,
    phase: WavePhase,
    format: StreamFormat,
    geometry: BufferGeometry,
    recovery: RecoveryConfig,
    messages: Consumer<ToneMessage>,
    /// Set after a recovery left the device prepared; cleared by the restart
    restart_armed: bool,
    status: Arc<Status>,
}

impl ToneFiller {
    pub fn new(
        tone: ToneGenerator,
        format: StreamFormat,
        geometry: BufferGeometry,
        recovery: RecoveryConfig,
        messages: Consumer<ToneMessage>,
        status: Arc<Status>,
    ) -> Self {
        Self {
            tone,
            phase: WavePhase::ZERO,
            format,
            geometry,
            recovery,
            messages,
            restart_armed: false,
            status,
        }
    }

    pub fn phase(&self) -> WavePhase {
        self.phase
    }

    fn apply_messages(&mut self) {
        while let Ok(msg) = self.messages.pop() {
            debug!("tone message: {msg:?}");
            self.tone.apply(msg);
        }
    }

    /// Writes two periods into a prepared device, then starts it.
    pub fn prime<D: DeviceSession + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        self.apply_messages();
        if let Some(err) = device.state().fault() {
            self.handle(device, err)?;
        }

        for _ in 0..2 {
            self.write_period(device).map_err(|err| self.fatal(err))?;
        }
        device.start().map_err(|err| self.fatal(err))?;

        self.restart_armed = false;
        self.status.set_state(PlaybackState::Running);
        info!(
            "primed {} frames, playback running",
            2 * self.geometry.period_frames
        );
        Ok(())
    }

    /// Handles one wake: recovers faults, then fills whole periods while there
    /// is room for them.
    pub fn service<D: DeviceSession + ?Sized>(&mut self, device: &mut D) -> Result<Wake> {
        self.apply_messages();
        self.status.count_wake();

        let period = self.geometry.period_frames;
        let mut wake = Wake::default();

        loop {
            if let Some(err) = device.state().fault() {
                self.handle(device, err)?;
                continue;
            }

            let avail = match device.available_frames() {
                Ok(avail) => avail,
                Err(err) => {
                    self.handle(device, err)?;
                    continue;
                }
            };

            if avail < period {
                if self.restart_armed {
                    self.restart_armed = false;
                    if let Err(err) = device.start() {
                        self.handle(device, err)?;
                        continue;
                    }
                    self.status.set_state(PlaybackState::Running);
                    wake.restarted = true;
                    info!("ring refilled, device restarted");
                }
                debug!("wake done: {} frames written, {avail} free", wake.frames);
                return Ok(wake);
            }

            match self.write_period(device) {
                Ok(0) => return Ok(wake),
                Ok(frames) => wake.frames += frames,
                Err(err) => self.handle(device, err)?,
            }
        }
    }

    /// Fills one period, looping over partial grants.
    fn write_period<D: DeviceSession + ?Sized>(&mut self, device: &mut D) -> core::result::Result<usize, DeviceError> {
        let period = self.geometry.period_frames;
        let mut remaining = period;

        while remaining > 0 {
            let mut region = device.begin_access(remaining)?;
            let granted = region.frames();
            if granted == 0 {
                break;
            }
            self.phase = self.tone.fill_region(&mut region, &self.format, self.phase);
            drop(region);

            device.commit(granted)?;
            remaining -= granted;
            self.status.count_frames(granted);
        }

        Ok(period - remaining)
    }

    /// Routes a device error through recovery.
    fn handle<D: DeviceSession + ?Sized>(&mut self, device: &mut D, err: DeviceError) -> Result<()> {
        let Some(fault) = Fault::classify(&err) else {
            return Err(self.fatal(err));
        };

        self.status.set_state(PlaybackState::Fault);
        let status = &self.status;
        let recovered = match recover_with(device, fault, &self.recovery, |backoff| status.sleep_unless_stopped(backoff)) {
            Ok(recovered) => recovered,
            Err(err @ (PumpError::Underrun | PumpError::Suspended)) => {
                info!("stop requested during recovery, leaving device {:?}", device.state());
                return Err(err);
            }
            Err(err) => {
                error!("recovery failed: {err}");
                status.set_state(PlaybackState::Stopped);
                return Err(err);
            }
        };
        self.status.count_recovery(fault);

        if recovered.needs_start() {
            self.restart_armed = true;
        } else {
            self.status.set_state(PlaybackState::Running);
        }
        Ok(())
    }

    fn fatal(&self, err: DeviceError) -> PumpError {
        error!("fatal device error: {err}");
        self.status.set_state(PlaybackState::Stopped);
        PumpError::Unrecoverable(err)
    }
}

/// Runs a shared [`ToneFiller`] from the device's consumer context.
pub(crate) struct CallbackFill(pub Arc<Mutex<ToneFiller>>);

impl CallbackFill {
    pub fn boxed(filler: &Arc<Mutex<ToneFiller>>) -> Box<dyn BufferReadyHandler> {
        Box::new(CallbackFill(Arc::clone(filler)))
    }
}

impl BufferReadyHandler for CallbackFill {
    fn buffer_ready(&mut self, device: &mut dyn DeviceSession) -> Result<()> {
        self.0.lock().service(device).map(|_| ())
    }
}
