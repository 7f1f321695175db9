//! Virtual PCM core shared by the bundled device sessions.
//!
//! Models a hardware ring the way a sound card exposes it: a byte buffer, a
//! hardware pointer advanced by the consumer, an application pointer advanced
//! by commits, and a device state that flips to `Underrun` when the consumer
//! catches up with the application pointer while running.
//!
//! Pointers count frames since the last prepare and never wrap; ring
//! positions are taken modulo the buffer size.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::device::{BufferReadyHandler, DeviceSession, DeviceState};
use crate::error::{DeviceError, PumpError};
use crate::event::PeriodEvent;
use crate::format::{BufferGeometry, ChannelArea, Layout, StreamFormat};
use crate::ring::{AccessMode, Region, RegionBytes, RingBufferAdapter};

/// Scripted answer to one `resume` call on a suspended device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResumeOutcome {
    /// Device is back
    Resumed,
    /// Suspend flag still raised
    TryAgain,
    /// Resume is not possible; a prepare is needed
    Failed,
}

/// Faults queued up by a test or diagnostic tool.
#[derive(Debug, Default)]
pub(crate) struct InjectedFaults {
    pub resume_script: VecDeque<ResumeOutcome>,
    pub failing_prepares: u32,
    pub resume_calls: u32,
    pub prepare_calls: u32,
}

struct HandlerSlot {
    handler: Box<dyn BufferReadyHandler>,
    staging: Vec<u8>,
}

pub(crate) struct PcmShared {
    format: StreamFormat,
    geometry: BufferGeometry,
    mode: AccessMode,
    ring_areas: Vec<ChannelArea>,
    staging_areas: Vec<ChannelArea>,
    data: Mutex<Box<[u8]>>,
    /// Notified whenever the consumer frees space or the state changes
    space: Condvar,
    hw_ptr: AtomicU64,
    appl_ptr: AtomicU64,
    state: AtomicU8,
    event: Arc<PeriodEvent>,
    handler: Mutex<Option<HandlerSlot>>,
    handler_error: Mutex<Option<PumpError>>,
    pub(crate) faults: Mutex<InjectedFaults>,
    submit_timeout: Duration,
}

impl PcmShared {
    pub fn new(
        format: StreamFormat,
        geometry: BufferGeometry,
        layout: Layout,
        mode: AccessMode,
        submit_timeout: Duration,
    ) -> Arc<Self> {
        let silence = format.sample_format.silence();
        let bytes = geometry.buffer_frames * format.frame_bytes();

        Arc::new(Self {
            ring_areas: ChannelArea::for_layout(layout, &format, geometry.buffer_frames),
            staging_areas: ChannelArea::interleaved(&format),
            data: Mutex::new(vec![silence; bytes].into_boxed_slice()),
            space: Condvar::new(),
            hw_ptr: AtomicU64::new(0),
            appl_ptr: AtomicU64::new(0),
            state: AtomicU8::new(DeviceState::Prepared as u8),
            event: Arc::new(PeriodEvent::new()),
            handler: Mutex::new(None),
            handler_error: Mutex::new(None),
            faults: Mutex::new(InjectedFaults::default()),
            format,
            geometry,
            mode,
            submit_timeout,
        })
    }

    #[inline]
    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    #[inline]
    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn hw_frames(&self) -> u64 {
        self.hw_ptr.load(Ordering::Acquire)
    }

    pub fn appl_frames(&self) -> u64 {
        self.appl_ptr.load(Ordering::Acquire)
    }

    /// Frames committed but not yet played.
    #[inline]
    fn queued(&self) -> usize {
        (self.appl_frames() - self.hw_frames()) as usize
    }

    pub fn available(&self) -> Result<usize, DeviceError> {
        if let Some(fault) = self.state().fault() {
            return Err(fault);
        }
        Ok(self.geometry.buffer_frames - self.queued())
    }

    /// Plays up to `frames` frames into `out` as interleaved samples.
    ///
    /// Outside the running state the device plays silence and the hardware
    /// pointer stays put. Returns the number of frames taken from the ring.
    pub fn consume(self: &Arc<Self>, frames: usize, out: &mut [u8]) -> usize {
        let frame_bytes = self.format.frame_bytes();
        let frames = frames.min(out.len() / frame_bytes);
        out.fill(self.format.sample_format.silence());

        if self.state() != DeviceState::Running {
            return 0;
        }

        let width = self.format.sample_format.bytes();
        let buffer = self.geometry.buffer_frames as u64;
        let period = self.geometry.period_frames as u64;

        let (hw, played) = {
            let data = self.data.lock();
            let hw = self.hw_frames();
            let played = frames.min(self.queued());

            for i in 0..played {
                let pos = ((hw + i as u64) % buffer) as usize;
                for (ch, area) in self.ring_areas.iter().enumerate() {
                    let src = area.byte_offset(pos);
                    let dst = i * frame_bytes + ch * width;
                    out[dst..dst + width].copy_from_slice(&data[src..src + width]);
                }
            }

            self.hw_ptr.store(hw + played as u64, Ordering::Release);
            if played < frames {
                self.set_state(DeviceState::Underrun);
            }
            self.space.notify_all();
            (hw, played)
        };

        let underrun = played < frames;
        if underrun || (hw + played as u64) / period > hw / period {
            self.event.set();
            self.dispatch();
        }

        played
    }

    /// Runs the registered buffer-ready handler, if any.
    fn dispatch(self: &Arc<Self>) {
        let mut slot = self.handler.lock();
        let Some(active) = slot.as_mut() else {
            return;
        };

        let staging = core::mem::take(&mut active.staging);
        let mut port = PcmPort::with_staging(Arc::clone(self), staging, true);
        let result = active.handler.buffer_ready(&mut port);
        active.staging = port.staging;

        if let Err(err) = result {
            *slot = None;
            *self.handler_error.lock() = Some(err);
            self.event.set();
        }
    }

    pub fn start(&self) -> Result<(), DeviceError> {
        match self.state() {
            DeviceState::Prepared => {
                self.set_state(DeviceState::Running);
                Ok(())
            }
            DeviceState::Running => Ok(()),
            state => Err(state.fault().unwrap_or(DeviceError::BadState { op: "start", state })),
        }
    }

    pub fn stop(&self) -> Result<(), DeviceError> {
        if self.state() == DeviceState::Disconnected {
            return Err(DeviceError::Disconnected("device removed".into()));
        }
        self.reset_pointers();
        Ok(())
    }

    pub fn prepare(&self) -> Result<(), DeviceError> {
        {
            let mut faults = self.faults.lock();
            faults.prepare_calls += 1;
            if faults.failing_prepares > 0 {
                faults.failing_prepares -= 1;
                return Err(DeviceError::Backend("prepare failed".into()));
            }
        }
        if self.state() == DeviceState::Disconnected {
            return Err(DeviceError::Disconnected("device removed".into()));
        }
        self.reset_pointers();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), DeviceError> {
        let outcome = {
            let mut faults = self.faults.lock();
            faults.resume_calls += 1;
            faults.resume_script.pop_front()
        };

        let state = self.state();
        if state != DeviceState::Suspended {
            return Err(DeviceError::BadState { op: "resume", state });
        }

        match outcome {
            Some(ResumeOutcome::TryAgain) => Err(DeviceError::TryAgain),
            Some(ResumeOutcome::Failed) => Err(DeviceError::Backend("resume failed".into())),
            Some(ResumeOutcome::Resumed) | None => {
                self.set_state(DeviceState::Running);
                Ok(())
            }
        }
    }

    /// Drops queued frames and leaves the device prepared.
    fn reset_pointers(&self) {
        let _data = self.data.lock();
        self.appl_ptr.store(self.hw_frames(), Ordering::Release);
        self.set_state(DeviceState::Prepared);
        self.space.notify_all();
    }

    /// Forces the device into a fault state and wakes every waiter.
    pub fn raise(&self, state: DeviceState) {
        {
            let _data = self.data.lock();
            self.set_state(state);
            self.space.notify_all();
        }
        self.event.set();
    }

    /// Copies `frames` interleaved frames from `staged` into the ring,
    /// waiting for room if needed.
    fn submit(&self, staged: &[u8], frames: usize) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.submit_timeout;
        let width = self.format.sample_format.bytes();
        let buffer = self.geometry.buffer_frames as u64;

        let mut data = self.data.lock();
        loop {
            if let Some(fault) = self.state().fault() {
                return Err(fault);
            }
            if self.geometry.buffer_frames - self.queued() >= frames {
                break;
            }
            if self.space.wait_until(&mut data, deadline).timed_out() {
                return Err(DeviceError::SubmitTimeout);
            }
        }

        let appl = self.appl_frames();
        for i in 0..frames {
            let pos = ((appl + i as u64) % buffer) as usize;
            for (ring, stage) in self.ring_areas.iter().zip(&self.staging_areas) {
                let src = stage.byte_offset(i);
                let dst = ring.byte_offset(pos);
                data[dst..dst + width].copy_from_slice(&staged[src..src + width]);
            }
        }
        self.appl_ptr.store(appl + frames as u64, Ordering::Release);
        Ok(())
    }
}

/// Producer-side access to a [`PcmShared`] ring.
pub(crate) struct PcmPort {
    shared: Arc<PcmShared>,
    staging: Vec<u8>,
    pending: Option<usize>,
    in_callback: bool,
}

impl PcmPort {
    pub fn new(shared: Arc<PcmShared>) -> Self {
        let staging = staging_for(&shared);
        Self::with_staging(shared, staging, false)
    }

    fn with_staging(shared: Arc<PcmShared>, staging: Vec<u8>, in_callback: bool) -> Self {
        Self {
            shared,
            staging,
            pending: None,
            in_callback,
        }
    }

    pub fn shared(&self) -> &Arc<PcmShared> {
        &self.shared
    }
}

fn staging_for(shared: &PcmShared) -> Vec<u8> {
    match shared.mode {
        AccessMode::Mapped => Vec::new(),
        AccessMode::Staged => {
            vec![shared.format.sample_format.silence(); shared.geometry.period_frames * shared.format.frame_bytes()]
        }
    }
}

impl RingBufferAdapter for PcmPort {
    fn access_mode(&self) -> AccessMode {
        self.shared.mode
    }

    fn begin_access(&mut self, frames_requested: usize) -> Result<Region<'_>, DeviceError> {
        let avail = self.shared.available()?;
        let shared = &*self.shared;
        let buffer = shared.geometry.buffer_frames;

        match shared.mode {
            AccessMode::Mapped => {
                let offset = (shared.appl_frames() % buffer as u64) as usize;
                let granted = frames_requested.min(avail).min(buffer - offset);
                self.pending = Some(granted);
                Ok(Region::new(
                    RegionBytes::Mapped(shared.data.lock()),
                    &shared.ring_areas,
                    offset,
                    granted,
                ))
            }
            AccessMode::Staged => {
                let granted = frames_requested.min(avail).min(shared.geometry.period_frames);
                self.pending = Some(granted);
                Ok(Region::new(
                    RegionBytes::Staged(&mut self.staging),
                    &shared.staging_areas,
                    0,
                    granted,
                ))
            }
        }
    }

    fn commit(&mut self, frames_written: usize) -> Result<(), DeviceError> {
        let granted = self.pending.take().ok_or(DeviceError::BadState {
            op: "commit without a region",
            state: self.shared.state(),
        })?;
        if frames_written != granted {
            return Err(DeviceError::ShortCommit {
                granted,
                committed: frames_written,
            });
        }
        if let Some(fault) = self.shared.state().fault() {
            return Err(fault);
        }

        match self.shared.mode {
            AccessMode::Mapped => {
                self.shared.appl_ptr.fetch_add(frames_written as u64, Ordering::AcqRel);
                Ok(())
            }
            AccessMode::Staged => self.shared.submit(&self.staging, frames_written),
        }
    }
}

impl DeviceSession for PcmPort {
    fn format(&self) -> &StreamFormat {
        self.shared.format()
    }

    fn geometry(&self) -> BufferGeometry {
        self.shared.geometry()
    }

    fn state(&self) -> DeviceState {
        self.shared.state()
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        self.shared.available()
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.shared.start()
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.pending = None;
        self.shared.stop()
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.pending = None;
        self.shared.prepare()
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.shared.resume()
    }

    fn period_event(&self) -> Arc<PeriodEvent> {
        Arc::clone(&self.shared.event)
    }

    fn set_buffer_ready_handler(&mut self, handler: Box<dyn BufferReadyHandler>) -> Result<(), DeviceError> {
        if self.in_callback {
            return Err(DeviceError::BadState {
                op: "register a handler from a handler",
                state: self.shared.state(),
            });
        }
        let staging = staging_for(&self.shared);
        *self.shared.handler.lock() = Some(HandlerSlot { handler, staging });
        self.shared.handler_error.lock().take();
        Ok(())
    }

    fn take_buffer_ready_handler(&mut self) -> Option<Box<dyn BufferReadyHandler>> {
        if self.in_callback {
            return None;
        }
        self.shared.handler.lock().take().map(|slot| slot.handler)
    }

    fn take_handler_error(&mut self) -> Option<PumpError> {
        self.shared.handler_error.lock().take()
    }
}
