//! Stream format, buffer geometry and channel area descriptions.

use core::time::Duration;

use crate::error::{PumpError, Result};

/// Sample encoding of a stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SampleFormat {
    /// 8-bit unsigned, silence at 0x80
    U8,
    /// 16-bit signed
    S16,
    /// 24-bit signed in the low three bytes of a 32-bit container
    S24,
    /// 32-bit signed
    S32,
    /// 32-bit IEEE float, full scale at ±1.0
    F32,
}

impl SampleFormat {
    /// Number of significant bits per sample.
    pub fn bits(self) -> u32 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::S16 => 16,
            SampleFormat::S24 => 24,
            SampleFormat::S32 | SampleFormat::F32 => 32,
        }
    }

    /// Width of one sample in memory, in bits.
    pub fn physical_width(self) -> usize {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::S16 => 16,
            SampleFormat::S24 | SampleFormat::S32 | SampleFormat::F32 => 32,
        }
    }

    /// Width of one sample in memory, in bytes.
    #[inline]
    pub fn bytes(self) -> usize {
        self.physical_width() / 8
    }

    /// Byte pattern of one silent sample.
    pub fn silence(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }
}

/// Byte order of multi-byte samples.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the target platform.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// How channels are arranged inside the device ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Layout {
    /// Samples of one frame are adjacent
    #[default]
    Interleaved,
    /// Each channel owns a contiguous block of the ring
    NonInterleaved,
}

/// The negotiated format of a stream. Fixed for the lifetime of a session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub byte_order: ByteOrder,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, sample_format: SampleFormat, channels: u16) -> Self {
        Self {
            sample_rate,
            sample_format,
            channels,
            byte_order: ByteOrder::native(),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Bytes per frame (one sample for every channel).
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.bytes() * self.channels as usize
    }

    /// Converts a duration to the nearest whole number of frames.
    pub fn frames_for(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as usize
    }

    /// Playback time covered by `frames`.
    pub fn duration_of(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PumpError::InvalidConfig("sample rate must be positive".into()));
        }
        if self.channels == 0 {
            return Err(PumpError::InvalidConfig("at least one channel is required".into()));
        }
        Ok(())
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(44_100, SampleFormat::S16, 2)
    }
}

/// Ring buffer and period sizes in frames.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BufferGeometry {
    pub buffer_frames: usize,
    pub period_frames: usize,
}

impl BufferGeometry {
    /// Builds a geometry, checking that the buffer holds a whole number of
    /// periods and at least two of them.
    pub fn new(buffer_frames: usize, period_frames: usize) -> Result<Self> {
        if period_frames == 0 {
            return Err(PumpError::InvalidConfig("period must hold at least one frame".into()));
        }
        if buffer_frames % period_frames != 0 {
            return Err(PumpError::InvalidConfig(format!(
                "buffer of {buffer_frames} frames is not a multiple of the {period_frames} frame period"
            )));
        }
        if buffer_frames < 2 * period_frames {
            return Err(PumpError::InvalidConfig(format!(
                "buffer of {buffer_frames} frames cannot hold two {period_frames} frame periods"
            )));
        }
        Ok(Self {
            buffer_frames,
            period_frames,
        })
    }

    /// Number of periods in the ring.
    #[inline]
    pub fn periods(&self) -> usize {
        self.buffer_frames / self.period_frames
    }
}

/// Location of one channel inside a byte region, in bits.
///
/// Sample `n` of the channel starts at bit `first + n * step`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelArea {
    pub first: usize,
    pub step: usize,
}

impl ChannelArea {
    /// Areas for an interleaved region.
    pub fn interleaved(format: &StreamFormat) -> Vec<ChannelArea> {
        let width = format.sample_format.physical_width();
        let channels = format.channels as usize;
        (0..channels)
            .map(|ch| ChannelArea {
                first: ch * width,
                step: channels * width,
            })
            .collect()
    }

    /// Areas for a non-interleaved region holding `frames` frames per channel.
    pub fn non_interleaved(format: &StreamFormat, frames: usize) -> Vec<ChannelArea> {
        let width = format.sample_format.physical_width();
        (0..format.channels as usize)
            .map(|ch| ChannelArea {
                first: ch * frames * width,
                step: width,
            })
            .collect()
    }

    pub fn for_layout(layout: Layout, format: &StreamFormat, frames: usize) -> Vec<ChannelArea> {
        match layout {
            Layout::Interleaved => Self::interleaved(format),
            Layout::NonInterleaved => Self::non_interleaved(format, frames),
        }
    }

    /// Byte offset of sample `frame` in this area.
    #[inline]
    pub fn byte_offset(&self, frame: usize) -> usize {
        (self.first + frame * self.step) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_partial_periods() {
        assert!(BufferGeometry::new(1000, 300).is_err());
        assert!(BufferGeometry::new(300, 300).is_err());
        assert!(BufferGeometry::new(600, 0).is_err());
        assert_eq!(BufferGeometry::new(1200, 300).unwrap().periods(), 4);
    }

    #[test]
    fn s24_uses_a_four_byte_container() {
        let format = StreamFormat::new(48_000, SampleFormat::S24, 2);
        assert_eq!(format.frame_bytes(), 8);
        assert_eq!(SampleFormat::S24.bits(), 24);
    }

    #[test]
    fn areas_match_layouts() {
        let format = StreamFormat::new(48_000, SampleFormat::S16, 2);
        let inter = ChannelArea::interleaved(&format);
        assert_eq!(inter[1], ChannelArea { first: 16, step: 32 });
        assert_eq!(inter[1].byte_offset(3), 14);

        let planar = ChannelArea::non_interleaved(&format, 100);
        assert_eq!(planar[1], ChannelArea { first: 1600, step: 16 });
        assert_eq!(planar[1].byte_offset(3), 206);
    }

    #[test]
    fn frame_time_conversions() {
        let format = StreamFormat::default();
        assert_eq!(format.frames_for(Duration::from_millis(100)), 4410);
        assert_eq!(format.duration_of(44_100), Duration::from_secs(1));
    }
}
