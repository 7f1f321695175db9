//! Acquire/commit access to a device ring buffer.

use core::ops::{Deref, DerefMut};

use parking_lot::MutexGuard;

use crate::error::DeviceError;
use crate::format::ChannelArea;

/// How a writer reaches the device ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum AccessMode {
    /// Write straight into device memory
    #[default]
    Mapped,
    /// Fill an owned intermediate buffer, then submit it to the device
    Staged,
}

/// Bytes behind a [`Region`]
pub(crate) enum RegionBytes<'a> {
    /// The whole device ring, locked for the lifetime of the region
    Mapped(MutexGuard<'a, Box<[u8]>>),
    /// The session's staging buffer
    Staged(&'a mut [u8]),
}

impl Deref for RegionBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            RegionBytes::Mapped(guard) => guard,
            RegionBytes::Staged(bytes) => bytes,
        }
    }
}

impl DerefMut for RegionBytes<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            RegionBytes::Mapped(guard) => guard,
            RegionBytes::Staged(bytes) => bytes,
        }
    }
}

/// A writable window into the ring handed out by [`RingBufferAdapter::begin_access`].
///
/// Frames `offset..offset + frames` of every channel area may be written.
/// The region must be dropped before the matching `commit`.
pub struct Region<'a> {
    bytes: RegionBytes<'a>,
    areas: &'a [ChannelArea],
    offset: usize,
    frames: usize,
}

impl<'a> Region<'a> {
    pub(crate) fn new(bytes: RegionBytes<'a>, areas: &'a [ChannelArea], offset: usize, frames: usize) -> Self {
        Self {
            bytes,
            areas,
            offset,
            frames,
        }
    }

    /// First writable frame within the areas.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Frames granted, possibly fewer than requested.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn areas(&self) -> &[ChannelArea] {
        self.areas
    }

    /// Raw bytes together with the areas that address them.
    pub fn parts_mut(&mut self) -> (&mut [u8], &[ChannelArea]) {
        (&mut *self.bytes, self.areas)
    }
}

/// Access to a hardware-style circular buffer.
///
/// Writers loop until their total is written: `begin_access` may grant fewer
/// frames than requested, and each grant is published with `commit`.
pub trait RingBufferAdapter {
    fn access_mode(&self) -> AccessMode;

    /// Reserves up to `frames_requested` frames.
    ///
    /// The grant is never larger than the request nor than the free space.
    fn begin_access(&mut self, frames_requested: usize) -> Result<Region<'_>, DeviceError>;

    /// Publishes the frames written into the last region.
    ///
    /// Fails when `frames_written` differs from the grant, or when the device
    /// ran dry while the region was reserved.
    fn commit(&mut self, frames_written: usize) -> Result<(), DeviceError>;
}
