//! Sine tone synthesis into channel areas.

use core::f64::consts::TAU;

use crate::format::{ByteOrder, ChannelArea, SampleFormat, StreamFormat};
use crate::ring::Region;

/// Messages to control the tone while the pump is running
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ToneMessage {
    SetFrequency(f64),
    SetAmplitude(f64),
}

/// Oscillator phase in radians, always within `[0, 2π)`.
///
/// The phase is the only state that survives between fills; carrying it from
/// one [`ToneGenerator::fill`] call into the next keeps the waveform continuous.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct WavePhase(f64);

impl WavePhase {
    pub const ZERO: WavePhase = WavePhase(0.0);

    /// Builds a phase, wrapping `radians` into `[0, 2π)`.
    pub fn new(radians: f64) -> Self {
        Self::ZERO.advanced(radians)
    }

    #[inline]
    pub fn radians(self) -> f64 {
        self.0
    }

    /// The phase after moving forward by `step` radians.
    #[inline]
    pub fn advanced(self, step: f64) -> Self {
        let mut phase = self.0 + step;
        if !(0.0..TAU).contains(&phase) {
            phase = phase.rem_euclid(TAU);
            // rem_euclid may round up to exactly 2π
            if phase >= TAU {
                phase = 0.0;
            }
        }
        WavePhase(phase)
    }
}

/// A sine tone of fixed frequency and amplitude factor.
///
/// Generation is a pure transform: no allocation, no I/O, no error path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToneGenerator {
    frequency: f64,
    amplitude: f64,
}

impl ToneGenerator {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency: frequency.max(0.0),
            amplitude: 1.0,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    #[inline]
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    #[inline]
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn apply(&mut self, msg: ToneMessage) {
        match msg {
            ToneMessage::SetFrequency(f) => self.frequency = f.max(0.0),
            ToneMessage::SetAmplitude(a) => self.amplitude = a.clamp(0.0, 1.0),
        }
    }

    /// Phase advance per frame at `sample_rate`.
    #[inline]
    pub fn phase_step(&self, sample_rate: u32) -> f64 {
        TAU * self.frequency / sample_rate as f64
    }

    /// Writes `frames` frames starting at frame `offset` of every area.
    ///
    /// Every channel receives the same sample. Returns the phase following the
    /// last written frame.
    pub fn fill(
        &self,
        bytes: &mut [u8],
        areas: &[ChannelArea],
        offset: usize,
        frames: usize,
        format: &StreamFormat,
        phase: WavePhase,
    ) -> WavePhase {
        let step = self.phase_step(format.sample_rate);
        let width = format.sample_format.bytes();
        let mut phase = phase;
        let mut sample = [0u8; 4];

        for frame in offset..offset + frames {
            encode(
                format.sample_format,
                format.byte_order,
                self.amplitude * phase.radians().sin(),
                &mut sample,
            );
            for area in areas {
                let at = area.byte_offset(frame);
                bytes[at..at + width].copy_from_slice(&sample[..width]);
            }
            phase = phase.advanced(step);
        }

        phase
    }

    /// Fills every frame granted by a ring buffer region.
    pub fn fill_region(&self, region: &mut Region<'_>, format: &StreamFormat, phase: WavePhase) -> WavePhase {
        let (offset, frames) = (region.offset(), region.frames());
        let (bytes, areas) = region.parts_mut();
        self.fill(bytes, areas, offset, frames, format, phase)
    }
}

/// Encodes one sample with value `level` in `[-1, 1]` into `out`.
fn encode(format: SampleFormat, order: ByteOrder, level: f64, out: &mut [u8; 4]) {
    macro_rules! put {
        ($v:expr) => {{
            let bytes = match order {
                ByteOrder::Little => $v.to_le_bytes(),
                ByteOrder::Big => $v.to_be_bytes(),
            };
            out[..bytes.len()].copy_from_slice(&bytes);
        }};
    }

    match format {
        SampleFormat::U8 => out[0] = (128.0 + (127.0 * level).round()) as u8,
        SampleFormat::S16 => put!((i16::MAX as f64 * level).round() as i16),
        // Sign-extended, so the sample sits in the low three bytes of the container
        SampleFormat::S24 => put!((8_388_607.0 * level).round() as i32),
        SampleFormat::S32 => put!((i32::MAX as f64 * level).round() as i32),
        // Adding 0.0 turns -0.0 into +0.0 so silence is all-zero bytes
        SampleFormat::F32 => put!((level + 0.0) as f32),
    }
}
