//! Real output devices through cpal.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, SizedSample, StreamConfig, StreamError, SupportedBufferSize};
use delegate::delegate;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::device::pcm::{PcmPort, PcmShared};
use crate::device::{negotiate, BufferReadyHandler, Capabilities, DeviceSession, DeviceState};
use crate::error::{DeviceError, PumpError, Result};
use crate::event::PeriodEvent;
use crate::format::{BufferGeometry, ByteOrder, SampleFormat, StreamFormat};
use crate::ring::{AccessMode, Region, RingBufferAdapter};

enum StreamCommand {
    Shutdown,
}

/// An output device opened through cpal.
///
/// The cpal stream lives on its own thread for the whole session and always
/// plays; while the session is not running it outputs silence. The ring is
/// drained from the cpal audio callback, which also runs the buffer-ready
/// handler in callback mode.
pub struct CpalSession {
    port: PcmPort,
    name: String,
    commands: Producer<StreamCommand>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalSession {
    /// Opens `config.device`, or the default output device.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let host = cpal::default_host();
        let device = match &config.device {
            Some(wanted) => host
                .output_devices()
                .map_err(|err| PumpError::ConfigurationUnsupported(err.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or_else(|| PumpError::ConfigurationUnsupported(format!("no output device named {wanted}")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| PumpError::ConfigurationUnsupported("no default output device".into()))?,
        };
        let name = device.name().unwrap_or_else(|_| "Unknown".into());

        let (caps, buffer_sizes) = capabilities(&device, &config.format)?;
        let (format, geometry) = negotiate(&caps, config)?;
        info!(
            "cpal device {name}: {}Hz {:?} x{}, period {} of {} frames",
            format.sample_rate, format.sample_format, format.channels, geometry.period_frames, geometry.buffer_frames
        );

        let stream_config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Fixed(geometry.period_frames as u32),
        };
        let shared = PcmShared::new(format, geometry, config.layout, config.access, config.submit_timeout);

        let (commands, command_rx) = RingBuffer::<StreamCommand>::new(4);
        let (init_tx, init_rx) = mpsc::sync_channel(1);
        let stream_shared = Arc::clone(&shared);

        let stream_thread = thread::Builder::new()
            .name("tonepump-cpal".into())
            .spawn(move || {
                let stream = match open_stream(&device, stream_config, &buffer_sizes, stream_shared) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));
                run_stream_thread(stream, command_rx);
            })
            .map_err(|err| PumpError::Unrecoverable(DeviceError::Backend(err.to_string())))?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = stream_thread.join();
                return Err(err);
            }
            Err(_) => {
                return Err(PumpError::Unrecoverable(DeviceError::Backend(
                    "stream thread exited during setup".into(),
                )))
            }
        }

        Ok(Self {
            port: PcmPort::new(shared),
            name,
            commands,
            stream_thread: Some(stream_thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalSession {
    fn drop(&mut self) {
        if let Some(stream_thread) = self.stream_thread.take() {
            let _ = self.commands.push(StreamCommand::Shutdown);
            stream_thread.thread().unpark();
            if stream_thread.join().is_err() {
                error!("cpal stream thread panicked");
            }
        }
    }
}

impl RingBufferAdapter for CpalSession {
    delegate! {
        to self.port {
            fn access_mode(&self) -> AccessMode;
            fn begin_access(&mut self, frames_requested: usize) -> core::result::Result<Region<'_>, DeviceError>;
            fn commit(&mut self, frames_written: usize) -> core::result::Result<(), DeviceError>;
        }
    }
}

impl DeviceSession for CpalSession {
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

/// Keeps the stream alive until told to shut down.
fn run_stream_thread(stream: cpal::Stream, mut commands: Consumer<StreamCommand>) {
    loop {
        match commands.pop() {
            Ok(StreamCommand::Shutdown) => break,
            Err(_) => thread::park(),
        }
    }
    drop(stream);
    debug!("cpal stream closed");
}

fn cpal_format(format: SampleFormat) -> Option<cpal::SampleFormat> {
    match format {
        SampleFormat::U8 => Some(cpal::SampleFormat::U8),
        SampleFormat::S16 => Some(cpal::SampleFormat::I16),
        SampleFormat::S32 => Some(cpal::SampleFormat::I32),
        SampleFormat::F32 => Some(cpal::SampleFormat::F32),
        // cpal has no 24-in-32 sample type
        SampleFormat::S24 => None,
    }
}

/// What the device offers for exactly `format`, with its raw buffer size range.
fn capabilities(device: &cpal::Device, format: &StreamFormat) -> Result<(Capabilities, SupportedBufferSize)> {
    let wanted = cpal_format(format.sample_format).ok_or_else(|| {
        PumpError::ConfigurationUnsupported(format!("{:?} cannot be played through cpal", format.sample_format))
    })?;

    let ranges: Vec<_> = device
        .supported_output_configs()
        .map_err(|err| PumpError::ConfigurationUnsupported(err.to_string()))?
        .collect();

    let range = ranges
        .iter()
        .find(|r| {
            r.channels() == format.channels
                && r.sample_format() == wanted
                && (r.min_sample_rate().0..=r.max_sample_rate().0).contains(&format.sample_rate)
        })
        .ok_or_else(|| {
            PumpError::ConfigurationUnsupported(format!(
                "device has no {}Hz {:?} x{} output",
                format.sample_rate, format.sample_format, format.channels
            ))
        })?;

    let defaults = Capabilities::default();
    let (min_period_frames, max_period_frames) = match range.buffer_size() {
        SupportedBufferSize::Range { min, max } => (*min as usize, *max as usize),
        SupportedBufferSize::Unknown => (defaults.min_period_frames, defaults.max_period_frames),
    };

    let caps = Capabilities {
        sample_formats: vec![format.sample_format],
        min_sample_rate: format.sample_rate,
        max_sample_rate: format.sample_rate,
        max_channels: format.channels,
        min_period_frames,
        max_period_frames,
    };
    Ok((caps, range.buffer_size().clone()))
}

/// Buffer size to try after the device rejected `rejected`.
///
/// An out-of-range size is moved to the nearest one the device reports; a
/// size inside the range was rejected for its alignment, so the device picks
/// its own. `None` once the device default has been refused too.
fn realign(rejected: BufferSize, supported: &SupportedBufferSize) -> Option<BufferSize> {
    match (rejected, supported) {
        (BufferSize::Default, _) => None,
        (BufferSize::Fixed(frames), SupportedBufferSize::Range { min, max }) if *min <= *max => {
            let nearest = frames.clamp(*min, *max);
            if nearest != frames {
                Some(BufferSize::Fixed(nearest))
            } else {
                Some(BufferSize::Default)
            }
        }
        (BufferSize::Fixed(_), _) => Some(BufferSize::Default),
    }
}

/// Builds and plays the stream, reinitializing with a realigned buffer size
/// while the device rejects the one asked for.
fn open_stream(
    device: &cpal::Device,
    mut config: StreamConfig,
    supported: &SupportedBufferSize,
    shared: Arc<PcmShared>,
) -> Result<cpal::Stream> {
    if shared.format().sample_format == SampleFormat::S24 {
        return Err(PumpError::ConfigurationUnsupported("S24 cannot be played through cpal".into()));
    }

    let stream = loop {
        match build_stream(device, &config, Arc::clone(&shared)) {
            Ok(stream) => break stream,
            Err(cpal::BuildStreamError::StreamConfigNotSupported) => match realign(config.buffer_size, supported) {
                Some(size) => {
                    warn!("device rejected buffer size {:?}, retrying with {size:?}", config.buffer_size);
                    config.buffer_size = size;
                }
                None => {
                    return Err(PumpError::ConfigurationUnsupported(
                        "stream configuration rejected by device".into(),
                    ))
                }
            },
            Err(err) => return Err(PumpError::Unrecoverable(DeviceError::Backend(err.to_string()))),
        }
    };

    stream
        .play()
        .map_err(|err| PumpError::Unrecoverable(DeviceError::Backend(err.to_string())))?;
    Ok(stream)
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<PcmShared>,
) -> core::result::Result<cpal::Stream, cpal::BuildStreamError> {
    match shared.format().sample_format {
        SampleFormat::U8 => build_typed::<u8>(device, config, shared),
        SampleFormat::S16 => build_typed::<i16>(device, config, shared),
        SampleFormat::S32 => build_typed::<i32>(device, config, shared),
        SampleFormat::F32 => build_typed::<f32>(device, config, shared),
        SampleFormat::S24 => Err(cpal::BuildStreamError::StreamConfigNotSupported),
    }
}

fn build_typed<T: RingSample>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<PcmShared>,
) -> core::result::Result<cpal::Stream, cpal::BuildStreamError> {
    let format = *shared.format();
    let frame_bytes = format.frame_bytes();
    let width = format.sample_format.bytes();
    let channels = format.channels as usize;
    let mut scratch = vec![0u8; shared.geometry().buffer_frames * frame_bytes];
    let error_shared = Arc::clone(&shared);

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            let bytes = frames * frame_bytes;
            if scratch.len() < bytes {
                scratch.resize(bytes, 0);
            }
            shared.consume(frames, &mut scratch[..bytes]);
            for (sample, raw) in data.iter_mut().zip(scratch[..bytes].chunks_exact(width)) {
                *sample = T::decode(raw, format.byte_order);
            }
        },
        move |err| {
            error!("cpal stream error: {err}");
            if matches!(err, StreamError::DeviceNotAvailable) {
                error_shared.raise(DeviceState::Disconnected);
            }
        },
        None,
    )
}

/// A cpal sample type the ring bytes can be decoded into.
trait RingSample: SizedSample + Send + 'static {
    fn decode(raw: &[u8], order: ByteOrder) -> Self;
}

macro_rules! ring_sample {
    ($($t:ty),*) => {
        $(
            impl RingSample for $t {
                #[inline]
                fn decode(raw: &[u8], order: ByteOrder) -> Self {
                    let mut bytes = [0u8; core::mem::size_of::<$t>()];
                    bytes.copy_from_slice(&raw[..bytes.len()]);
                    match order {
                        ByteOrder::Little => <$t>::from_le_bytes(bytes),
                        ByteOrder::Big => <$t>::from_be_bytes(bytes),
                    }
                }
            }
        )*
    };
}

ring_sample!(u8, i16, i32, f32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_period_moves_to_the_nearest_size() {
        let supported = SupportedBufferSize::Range { min: 256, max: 2048 };
        assert_eq!(realign(BufferSize::Fixed(4410), &supported), Some(BufferSize::Fixed(2048)));
        assert_eq!(realign(BufferSize::Fixed(64), &supported), Some(BufferSize::Fixed(256)));
    }

    #[test]
    fn misaligned_period_falls_back_to_the_device_default() {
        let supported = SupportedBufferSize::Range { min: 256, max: 2048 };
        assert_eq!(realign(BufferSize::Fixed(441), &supported), Some(BufferSize::Default));
        assert_eq!(realign(BufferSize::Fixed(441), &SupportedBufferSize::Unknown), Some(BufferSize::Default));
    }

    #[test]
    fn gives_up_once_the_default_is_refused() {
        let supported = SupportedBufferSize::Range { min: 256, max: 2048 };
        assert_eq!(realign(BufferSize::Default, &supported), None);
        assert_eq!(realign(BufferSize::Default, &SupportedBufferSize::Unknown), None);
    }
}
