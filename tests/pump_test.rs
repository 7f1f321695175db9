use std::thread;
use std::time::{Duration, Instant};

use tonepump::{
    AccessMode, ByteOrder, Capabilities, DeviceError, DeviceSession, DeviceState, Layout, PlaybackPump,
    PlaybackState, PumpError, SampleFormat, SessionConfig, SimClock, SimDevice, StopReason, StreamFormat,
    ToneGenerator, ToneMessage, WakeMode,
};

const PERIOD: usize = 441;
const BUFFER: usize = 4 * PERIOD;

/// 441 frame periods, four of them in the ring
fn config() -> SessionConfig {
    SessionConfig::default()
        .with_format(StreamFormat::new(44_100, SampleFormat::S16, 2).with_byte_order(ByteOrder::Little))
        .with_period_time(Duration::from_millis(10))
        .with_buffer_time(Duration::from_millis(40))
        .with_tone(ToneGenerator::new(110.0))
}

fn pump_for(config: &SessionConfig) -> (PlaybackPump<SimDevice>, tonepump::PumpHandle, SimClock) {
    let device = SimDevice::open(config).unwrap();
    let clock = device.clock();
    let (pump, handle) = PlaybackPump::new(device, config).unwrap();
    (pump, handle, clock)
}

/// Plays `periods` periods, servicing the pump after each one.
fn play(config: &SessionConfig, periods: usize) -> Vec<u8> {
    let (mut pump, _handle, clock) = pump_for(config);
    pump.start().unwrap();
    for _ in 0..periods {
        clock.advance_periods(1);
        pump.service().unwrap();
    }
    clock.played()
}

fn s16(bytes: &[u8], index: usize) -> i16 {
    i16::from_le_bytes([bytes[2 * index], bytes[2 * index + 1]])
}

#[test]
fn new_pump_is_prepared() {
    let (pump, handle, _clock) = pump_for(&config());
    assert_eq!(pump.state(), PlaybackState::Prepared);
    assert!(!handle.is_running());
    assert_eq!(pump.report().frames_written, 0);
}

#[test]
fn priming_writes_two_periods_then_starts() {
    let (mut pump, handle, clock) = pump_for(&config());
    assert_eq!(pump.device().geometry().period_frames, PERIOD);

    pump.start().unwrap();
    assert_eq!(clock.appl_frames(), 2 * PERIOD as u64);
    assert_eq!(clock.state(), DeviceState::Running);
    assert_eq!(pump.state(), PlaybackState::Running);
    assert!(handle.is_running());
    assert_eq!(handle.report().frames_written, 2 * PERIOD as u64);
}

#[test]
fn service_keeps_the_ring_full() {
    let (mut pump, handle, clock) = pump_for(&config());
    pump.start().unwrap();

    for _ in 0..20 {
        clock.advance_periods(1);
        let wake = pump.service().unwrap();
        assert!(wake.frames >= PERIOD);
        assert_eq!(clock.appl_frames() - clock.hw_frames(), BUFFER as u64);
    }

    assert_eq!(clock.state(), DeviceState::Running);
    let report = handle.report();
    assert_eq!(report.wakes, 20);
    assert_eq!(report.underrun_recoveries, 0);
    assert_eq!(report.frames_written, clock.appl_frames());

    let nothing = pump.service().unwrap();
    assert!(nothing.stalled());
}

#[test]
fn played_tone_matches_the_scenario() {
    let config = SessionConfig::default()
        .with_format(StreamFormat::new(44_100, SampleFormat::S16, 2).with_byte_order(ByteOrder::Little))
        .with_tone(ToneGenerator::new(110.0));
    let played = play(&config, 1);

    assert_eq!(played.len(), 4410 * 4);
    assert_eq!(s16(&played, 0), 0);
    assert_eq!(s16(&played, 1), 0);
    let expected = (32767.0 * (std::f64::consts::TAU * 110.0 * 100.0 / 44_100.0).sin()).round() as i16;
    assert!((s16(&played, 200) - expected).abs() <= 1);
}

#[test]
fn played_waveform_is_continuous_across_periods() {
    let played = play(&config(), 12);
    let step = std::f64::consts::TAU * 110.0 / 44_100.0;

    for frame in 0..12 * PERIOD {
        let expected = 32767.0 * (frame as f64 * step).sin();
        let got = s16(&played, 2 * frame) as f64;
        assert!((got - expected).abs() <= 1.5, "frame {frame}: {got} vs {expected}");
    }
}

#[test]
fn staged_access_plays_the_same_audio() {
    let mapped = play(&config(), 10);
    let staged = play(&config().with_access(AccessMode::Staged), 10);
    assert_eq!(mapped, staged);
}

#[test]
fn planar_ring_plays_the_same_audio() {
    let interleaved = play(&config(), 10);
    let planar = play(&config().with_layout(Layout::NonInterleaved), 10);
    assert_eq!(interleaved, planar);
}

#[test]
fn callback_mode_is_fed_by_the_device() {
    let config = config().with_wake(WakeMode::Callback);
    let (mut pump, handle, clock) = pump_for(&config);
    pump.start().unwrap();

    assert_eq!(clock.advance_periods(20), 20 * PERIOD);
    assert_eq!(clock.state(), DeviceState::Running);
    assert_eq!(clock.appl_frames() - clock.hw_frames(), BUFFER as u64);
    assert_eq!(handle.report().wakes, 20);

    pump.halt();
    assert_eq!(clock.state(), DeviceState::Prepared);
    // Handler is gone: the device no longer refills itself
    clock.advance_periods(1);
    assert_eq!(handle.report().wakes, 20);
}

#[test]
fn callback_mode_recovers_inside_the_callback() {
    let config = config().with_wake(WakeMode::Callback);
    let (mut pump, handle, clock) = pump_for(&config);
    pump.start().unwrap();

    clock.advance(3 * BUFFER);
    assert_eq!(clock.state(), DeviceState::Running);
    assert_eq!(handle.report().underrun_recoveries, 1);
    assert_eq!(pump.state(), PlaybackState::Running);
}

#[test]
fn callback_mode_reports_handler_failures() {
    let config = config().with_wake(WakeMode::Callback);
    let (mut pump, _handle, clock) = pump_for(&config);
    pump.start().unwrap();

    clock.fail_next_prepare();
    clock.advance(3 * BUFFER);
    assert_eq!(pump.state(), PlaybackState::Stopped);
    assert!(matches!(
        pump.device_mut().take_handler_error(),
        Some(PumpError::Unrecoverable(DeviceError::Backend(_)))
    ));
    assert!(pump.device_mut().take_buffer_ready_handler().is_none());
}

#[test]
fn tone_messages_apply_at_the_next_fill() {
    let (mut pump, mut handle, clock) = pump_for(&config());
    pump.start().unwrap();

    handle.send(ToneMessage::SetAmplitude(0.0)).unwrap();
    handle.send(ToneMessage::SetFrequency(220.0)).unwrap();
    pump.service().unwrap();
    assert_eq!(clock.advance_periods(4), BUFFER);

    let played = clock.played();
    let split = 2 * PERIOD * 4;
    assert!(played[..split].iter().any(|&b| b != 0));
    assert!(played[split..].iter().all(|&b| b == 0));
}

#[test]
fn message_queue_hands_back_overflow() {
    let (_pump, mut handle, _clock) = pump_for(&config());
    let mut accepted = 0;
    while handle.send(ToneMessage::SetFrequency(440.0)).is_ok() {
        accepted += 1;
        assert!(accepted <= 1024);
    }
    assert_eq!(accepted, 64);
    assert_eq!(
        handle.send(ToneMessage::SetAmplitude(0.5)),
        Err(ToneMessage::SetAmplitude(0.5))
    );
}

#[test]
fn event_mode_stops_within_one_period() {
    let config = SessionConfig::default().with_wake(WakeMode::Event);
    let (pump, handle, _clock) = pump_for(&config);
    let period = pump.device().format().duration_of(pump.device().geometry().period_frames);
    let worker = pump.spawn().unwrap();

    thread::sleep(Duration::from_millis(30));
    let asked = Instant::now();
    handle.stop();
    let (pump, result) = worker.join().unwrap();

    assert!(asked.elapsed() < period);
    assert_eq!(result, Ok(StopReason::Requested));
    assert_eq!(pump.state(), PlaybackState::Stopped);
    assert_eq!(pump.device().state(), DeviceState::Prepared);
}

#[test]
fn event_mode_detects_a_drained_stream() {
    let config = config().with_wake(WakeMode::Event).with_drain_on_stall(true);
    let (mut pump, handle, _clock) = pump_for(&config);

    // The clock never moves, so after topping up the ring nothing frees up
    assert_eq!(pump.run(), Ok(StopReason::Drained));
    assert_eq!(handle.state(), PlaybackState::Stopped);
    assert_eq!(handle.report().frames_written, BUFFER as u64);
}

#[test]
fn poll_mode_runs_again_after_stop() {
    let config = config().with_wake(WakeMode::Poll);
    let (pump, handle, clock) = pump_for(&config);

    let worker = pump.spawn().unwrap();
    thread::sleep(Duration::from_millis(20));
    handle.stop();
    let (pump, result) = worker.join().unwrap();
    assert_eq!(result, Ok(StopReason::Requested));
    let first = handle.report().frames_written;
    assert!(first >= 2 * PERIOD as u64);
    assert_eq!(clock.state(), DeviceState::Prepared);
    let phase = pump.phase();

    let worker = pump.spawn().unwrap();
    handle.stop();
    let (pump, result) = worker.join().unwrap();
    assert_eq!(result, Ok(StopReason::Requested));
    assert!(handle.report().frames_written >= first + 2 * PERIOD as u64);
    assert_ne!(pump.phase(), phase);
    assert_eq!(pump.state(), PlaybackState::Stopped);
}

#[test]
fn callback_mode_surfaces_a_lost_device() {
    let config = config().with_wake(WakeMode::Callback);
    let (pump, _handle, clock) = pump_for(&config);
    let worker = pump.spawn().unwrap();

    thread::sleep(Duration::from_millis(20));
    clock.disconnect();
    let (pump, result) = worker.join().unwrap();

    assert!(matches!(
        result,
        Err(PumpError::Unrecoverable(DeviceError::Disconnected(_)))
    ));
    assert_eq!(pump.state(), PlaybackState::Stopped);
}

#[test]
fn unsupported_format_is_rejected_before_playback() {
    let caps = Capabilities {
        sample_formats: vec![SampleFormat::S16],
        ..Capabilities::default()
    };
    let config = config().with_format(StreamFormat::new(44_100, SampleFormat::S24, 2));
    assert!(matches!(
        SimDevice::open_with(&caps, &config),
        Err(PumpError::ConfigurationUnsupported(_))
    ));

    let bad = config.with_period_time(Duration::ZERO);
    assert!(matches!(SimDevice::open(&bad), Err(PumpError::InvalidConfig(_))));
}
