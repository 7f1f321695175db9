//! The playback pump: keeps a device ring fed with a sine tone.
//!
//! A [`PlaybackPump`] owns a [`DeviceSession`] and runs the fill loop on the
//! calling thread (see [`PlaybackPump::run`] and [`PlaybackPump::spawn`]).
//! The matching [`PumpHandle`] stops it and retunes the tone from any thread.
//!
//! Wake sources, chosen with [`WakeMode`]:
//! - `Callback`: the device runs the fill logic itself; the pump thread only
//!   watches for stop requests and faults
//! - `Poll`: sleep half a period, then fill whatever room opened up
//! - `Event`: block on the device's period event, bounded by one period

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use rtrb::{Producer, RingBuffer};
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, WakeMode};
use crate::device::DeviceSession;
use crate::error::{PumpError, Result};
use crate::event::PeriodEvent;
use crate::recovery::Fault;
use crate::tone::{ToneMessage, WavePhase};

mod filler;

use filler::{CallbackFill, ToneFiller};
pub use filler::Wake;

/// Capacity of the tone message queue
const MESSAGE_CAPACITY: usize = 64;

/// Stalled event wakes in a row that count as a drained stream
const DRAIN_STALLS: u32 = 2;

/// Lifecycle of a pump, readable from any thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum PlaybackState {
    Stopped,
    /// Attached to a session, not started
    Prepared,
    Running,
    /// Recovering from an underrun or suspend
    Fault,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PlaybackState::Prepared,
            2 => PlaybackState::Running,
            3 => PlaybackState::Fault,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Why [`PlaybackPump::run`] returned without an error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StopReason {
    /// [`PumpHandle::stop`] was called
    Requested,
    /// The device stopped taking frames (event mode with `drain_on_stall`)
    Drained,
}

/// Counters collected while the pump runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PumpReport {
    pub frames_written: u64,
    pub wakes: u64,
    pub underrun_recoveries: u64,
    pub suspend_recoveries: u64,
}

/// State shared between a pump, its filler and its handle.
pub(crate) struct Status {
    state: AtomicU8,
    stop: AtomicBool,
    /// Guards stop requests so a recovery backoff can wait on `stopped`
    stop_lock: Mutex<()>,
    stopped: Condvar,
    /// Wakes the pump thread in poll and callback mode
    control: PeriodEvent,
    /// The device's period event, so stop can cut an event wait short
    device_event: Arc<PeriodEvent>,
    frames_written: AtomicU64,
    wakes: AtomicU64,
    underrun_recoveries: AtomicU64,
    suspend_recoveries: AtomicU64,
}

impl Status {
    fn new(device_event: Arc<PeriodEvent>) -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Prepared as u8),
            stop: AtomicBool::new(false),
            stop_lock: Mutex::new(()),
            stopped: Condvar::new(),
            control: PeriodEvent::new(),
            device_event,
            frames_written: AtomicU64::new(0),
            wakes: AtomicU64::new(0),
            underrun_recoveries: AtomicU64::new(0),
            suspend_recoveries: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        let _guard = self.stop_lock.lock();
        self.stop.store(true, Ordering::Release);
        self.stopped.notify_all();
    }

    /// Sleeps for `timeout` unless a stop comes in first.
    ///
    /// Returns `false` if stop was requested.
    pub fn sleep_unless_stopped(&self, timeout: Duration) -> bool {
        let mut guard = self.stop_lock.lock();
        let _ = self
            .stopped
            .wait_while_for(&mut guard, |_| !self.stop.load(Ordering::Acquire), timeout);
        !self.stop_requested()
    }

    pub fn count_wake(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_frames(&self, frames: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn count_recovery(&self, fault: Fault) {
        let counter = match fault {
            Fault::Underrun => &self.underrun_recoveries,
            Fault::Suspended => &self.suspend_recoveries,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> PumpReport {
        PumpReport {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            wakes: self.wakes.load(Ordering::Relaxed),
            underrun_recoveries: self.underrun_recoveries.load(Ordering::Relaxed),
            suspend_recoveries: self.suspend_recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Remote control for a [`PlaybackPump`].
pub struct PumpHandle {
    status: Arc<Status>,
    sender: Producer<ToneMessage>,
}

impl PumpHandle {
    /// Asks the pump to stop. It notices within one period.
    pub fn stop(&self) {
        self.status.request_stop();
        self.status.control.set();
        self.status.device_event.set();
    }

    /// Retunes the tone; applied at the start of the next fill.
    ///
    /// Hands the message back if the queue is full.
    pub fn send(&mut self, msg: ToneMessage) -> core::result::Result<(), ToneMessage> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn report(&self) -> PumpReport {
        self.status.report()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PlaybackState::Running | PlaybackState::Fault)
    }
}

/// The scheduling loop feeding one device session.
pub struct PlaybackPump<D: DeviceSession> {
    device: D,
    filler: Arc<Mutex<ToneFiller>>,
    status: Arc<Status>,
    wake: WakeMode,
    drain_on_stall: bool,
    period_time: Duration,
}

impl<D: DeviceSession> PlaybackPump<D> {
    /// Attaches a pump to an open session.
    ///
    /// The session's negotiated geometry is used, not the times requested in
    /// `config`.
    pub fn new(device: D, config: &SessionConfig) -> Result<(Self, PumpHandle)> {
        config.validate()?;
        let format = *device.format();
        let geometry = device.geometry();
        if geometry.period_frames == 0 || geometry.buffer_frames < 2 * geometry.period_frames {
            return Err(PumpError::ConfigurationUnsupported(format!(
                "device ring of {} frames cannot hold two {} frame periods",
                geometry.buffer_frames, geometry.period_frames
            )));
        }

        let (sender, receiver) = RingBuffer::<ToneMessage>::new(MESSAGE_CAPACITY);
        let status = Arc::new(Status::new(device.period_event()));
        let filler = ToneFiller::new(
            config.tone,
            format,
            geometry,
            config.recovery,
            receiver,
            Arc::clone(&status),
        );

        let pump = Self {
            filler: Arc::new(Mutex::new(filler)),
            status: Arc::clone(&status),
            wake: config.wake,
            drain_on_stall: config.drain_on_stall,
            period_time: format.duration_of(geometry.period_frames),
            device,
        };
        Ok((pump, PumpHandle { status, sender }))
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn report(&self) -> PumpReport {
        self.status.report()
    }

    /// Phase the next generated frame starts at.
    pub fn phase(&self) -> WavePhase {
        self.filler.lock().phase()
    }

    /// Primes the ring with two periods, starts the device and arms the wake
    /// source.
    pub fn start(&mut self) -> Result<()> {
        if self.wake == WakeMode::Callback {
            self.device
                .set_buffer_ready_handler(CallbackFill::boxed(&self.filler))
                .map_err(PumpError::Unrecoverable)?;
        }
        self.filler.lock().prime(&mut self.device)
    }

    /// Runs one wake by hand: recover faults, then fill while a period fits.
    pub fn service(&mut self) -> Result<Wake> {
        self.filler.lock().service(&mut self.device)
    }

    /// Plays until stopped, drained, or a fatal error.
    ///
    /// The device is left prepared, so `run` may be called again; the tone
    /// continues from the phase it stopped at.
    pub fn run(&mut self) -> Result<StopReason> {
        info!("pump starting ({:?} wake, period {:?})", self.wake, self.period_time);
        let result = match self.start().and_then(|()| self.wait_loop()) {
            // Recovery gave up on a fault because stop was requested
            Err(PumpError::Underrun | PumpError::Suspended) if self.status.stop_requested() => {
                Ok(StopReason::Requested)
            }
            result => result,
        };
        self.halt();
        match &result {
            Ok(reason) => info!("pump stopped: {reason:?}"),
            Err(err) => warn!("pump failed: {err}"),
        }
        result
    }

    fn wait_loop(&mut self) -> Result<StopReason> {
        let device_event = self.device.period_event();
        let mut stalls = 0;

        loop {
            if self.status.stop_requested() {
                return Ok(StopReason::Requested);
            }

            match self.wake {
                WakeMode::Callback => {
                    self.status.control.wait_timeout(self.period_time);
                    if let Some(err) = self.device.take_handler_error() {
                        return Err(err);
                    }
                    // A faulted device stops calling back; recover from here
                    if self.device.state().fault().is_some() && !self.status.stop_requested() {
                        self.service()?;
                    }
                    continue;
                }
                WakeMode::Poll => {
                    self.status.control.wait_timeout(self.period_time / 2);
                }
                WakeMode::Event => {
                    device_event.wait_timeout(self.period_time);
                }
            }

            if self.status.stop_requested() {
                return Ok(StopReason::Requested);
            }

            let wake = self.service()?;
            if self.wake == WakeMode::Event && self.drain_on_stall {
                if wake.stalled() {
                    stalls += 1;
                    if stalls >= DRAIN_STALLS {
                        return Ok(StopReason::Drained);
                    }
                } else {
                    stalls = 0;
                }
            }
        }
    }

    /// Removes the callback, stops the device and drops queued frames.
    pub fn halt(&mut self) {
        if self.device.take_buffer_ready_handler().is_some() {
            debug!("buffer-ready handler removed");
        }
        if let Err(err) = self.device.stop() {
            warn!("device stop failed: {err}");
        }
        self.status.set_state(PlaybackState::Stopped);
        self.status.stop.store(false, Ordering::Release);
        self.status.control.reset();
    }
}

impl<D: DeviceSession + 'static> PlaybackPump<D> {
    /// Runs the pump on a dedicated thread.
    ///
    /// Joining the thread gives the pump back together with the outcome of
    /// [`run`](Self::run).
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<(Self, Result<StopReason>)>> {
        thread::Builder::new().name("tonepump".into()).spawn(move || {
            let result = self.run();
            (self, result)
        })
    }
}
