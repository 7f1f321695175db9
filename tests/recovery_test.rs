use std::thread;
use std::time::{Duration, Instant};

use tonepump::{
    recover, recover_with, DeviceError, DeviceSession, DeviceState, Fault, PlaybackPump, PlaybackState, PumpError,
    Recovered, RecoveryConfig, ResumeOutcome, SessionConfig, SimDevice, StopReason, ToneGenerator, WakeMode,
};

fn config(recovery: RecoveryConfig) -> SessionConfig {
    SessionConfig::default()
        .with_period_time(Duration::from_millis(10))
        .with_buffer_time(Duration::from_millis(40))
        .with_tone(ToneGenerator::new(110.0))
        .with_recovery(recovery)
}

fn fast_retries(retries: u32) -> RecoveryConfig {
    RecoveryConfig::default()
        .with_resume_retries(retries)
        .with_resume_backoff(Duration::from_millis(5))
}

#[test]
fn faults_are_classified() {
    assert_eq!(Fault::classify(&DeviceError::Underrun), Some(Fault::Underrun));
    assert_eq!(
        Fault::classify(&DeviceError::ShortCommit {
            granted: 10,
            committed: 5
        }),
        Some(Fault::Underrun)
    );
    assert_eq!(Fault::classify(&DeviceError::Suspended), Some(Fault::Suspended));
    assert_eq!(Fault::classify(&DeviceError::Disconnected("gone".into())), None);
    assert_eq!(Fault::classify(&DeviceError::Backend("io".into())), None);
}

#[test]
fn underrun_is_cleared_with_prepare() {
    let mut device = SimDevice::open(&config(RecoveryConfig::default())).unwrap();
    let clock = device.clock();
    clock.inject_underrun();

    let recovered = recover(&mut device, Fault::Underrun, &RecoveryConfig::default()).unwrap();
    assert_eq!(recovered, Recovered::Prepared);
    assert!(recovered.needs_start());
    assert_eq!(device.state(), DeviceState::Prepared);
    assert_eq!(clock.prepare_calls(), 1);
}

#[test]
fn suspend_retries_exactly_three_times() {
    let policy = fast_retries(10);
    let mut device = SimDevice::open(&config(policy)).unwrap();
    let clock = device.clock();
    clock.inject_suspend();
    clock.script_resume([ResumeOutcome::TryAgain; 3]);

    let started = Instant::now();
    let recovered = recover(&mut device, Fault::Suspended, &policy).unwrap();

    assert_eq!(recovered, Recovered::Resumed { retries: 3 });
    assert!(!recovered.needs_start());
    assert_eq!(clock.resume_calls(), 4);
    assert_eq!(clock.prepare_calls(), 0);
    assert!(started.elapsed() >= 3 * policy.resume_backoff);
    assert_eq!(device.state(), DeviceState::Running);
}

#[test]
fn failed_resume_falls_back_to_prepare() {
    let policy = fast_retries(10);
    let mut device = SimDevice::open(&config(policy)).unwrap();
    let clock = device.clock();
    clock.inject_suspend();
    clock.script_resume([ResumeOutcome::Failed]);

    let recovered = recover(&mut device, Fault::Suspended, &policy).unwrap();
    assert_eq!(recovered, Recovered::PreparedAfterSuspend);
    assert_eq!(clock.resume_calls(), 1);
    assert_eq!(device.state(), DeviceState::Prepared);
}

#[test]
fn exhausted_resume_and_failed_prepare_is_unrecoverable() {
    let policy = fast_retries(2);
    let mut device = SimDevice::open(&config(policy)).unwrap();
    let clock = device.clock();
    clock.inject_suspend();
    clock.script_resume([ResumeOutcome::TryAgain; 5]);
    clock.fail_next_prepare();

    let err = recover(&mut device, Fault::Suspended, &policy).unwrap_err();
    assert!(matches!(err, PumpError::Unrecoverable(DeviceError::Backend(_))));
    assert_eq!(clock.resume_calls(), 3);
    assert_eq!(clock.prepare_calls(), 1);
}

#[test]
fn abandoned_resume_leaves_the_suspend_in_place() {
    let policy = fast_retries(10);
    let mut device = SimDevice::open(&config(policy)).unwrap();
    let clock = device.clock();
    clock.inject_suspend();
    clock.script_resume([ResumeOutcome::TryAgain; 5]);

    let mut waits = 0;
    let err = recover_with(&mut device, Fault::Suspended, &policy, |_| {
        waits += 1;
        waits < 2
    })
    .unwrap_err();

    assert_eq!(err, PumpError::Suspended);
    assert_eq!(waits, 2);
    assert_eq!(clock.resume_calls(), 2);
    assert_eq!(clock.prepare_calls(), 0);
    assert_eq!(device.state(), DeviceState::Suspended);
}

#[test]
fn stop_cuts_a_suspend_backoff_short() {
    // One second between resume attempts, 100ms periods
    let config = SessionConfig::default()
        .with_wake(WakeMode::Event)
        .with_recovery(RecoveryConfig::default());
    let device = SimDevice::open(&config).unwrap();
    let clock = device.clock();
    let (pump, handle) = PlaybackPump::new(device, &config).unwrap();
    let period = pump.device().format().duration_of(pump.device().geometry().period_frames);
    let worker = pump.spawn().unwrap();

    thread::sleep(Duration::from_millis(30));
    clock.script_resume([ResumeOutcome::TryAgain; 10]);
    clock.inject_suspend();
    thread::sleep(2 * period);
    assert_eq!(clock.resume_calls(), 1);
    assert_eq!(handle.state(), PlaybackState::Fault);

    let asked = Instant::now();
    handle.stop();
    let (pump, result) = worker.join().unwrap();

    assert!(asked.elapsed() < period, "stop took {:?}", asked.elapsed());
    assert_eq!(result, Ok(StopReason::Requested));
    assert_eq!(pump.state(), PlaybackState::Stopped);
    assert_eq!(pump.device().state(), DeviceState::Prepared);
    assert_eq!(handle.report().suspend_recoveries, 0);
}

#[test]
fn pump_recovers_from_underrun_mid_stream() {
    let config = config(RecoveryConfig::default());
    let device = SimDevice::open(&config).unwrap();
    let clock = device.clock();
    let (mut pump, handle) = PlaybackPump::new(device, &config).unwrap();

    pump.start().unwrap();
    clock.advance_periods(1);
    pump.service().unwrap();

    // The pump falls behind: the consumer drains the ring and keeps going
    clock.advance_periods(6);
    assert_eq!(clock.state(), DeviceState::Underrun);

    let wake = pump.service().unwrap();
    assert!(wake.restarted);
    assert_eq!(wake.frames, 1764);
    assert_eq!(pump.state(), PlaybackState::Running);
    assert_eq!(clock.state(), DeviceState::Running);
    assert_eq!(handle.report().underrun_recoveries, 1);
    assert_eq!(clock.prepare_calls(), 1);

    // Fresh ring position: prepare moved the application pointer back to the hardware one
    assert_eq!(clock.appl_frames() - clock.hw_frames(), 1764);
    assert_eq!(clock.advance_periods(4), 1764);
    assert_eq!(clock.state(), DeviceState::Running);
}

#[test]
fn pump_resumes_after_suspend_without_refilling() {
    let config = config(fast_retries(10));
    let device = SimDevice::open(&config).unwrap();
    let clock = device.clock();
    let (mut pump, handle) = PlaybackPump::new(device, &config).unwrap();

    pump.start().unwrap();
    let queued = clock.appl_frames() - clock.hw_frames();
    clock.inject_suspend();
    clock.script_resume([ResumeOutcome::TryAgain; 3]);

    let wake = pump.service().unwrap();
    assert!(!wake.restarted);
    assert_eq!(clock.resume_calls(), 4);
    assert_eq!(pump.state(), PlaybackState::Running);
    assert_eq!(handle.report().suspend_recoveries, 1);
    // Queued audio survives the suspend; the wake tops the ring up
    assert_eq!(wake.frames as u64 + queued, 1764);
}

#[test]
fn pump_stops_when_suspend_cannot_be_cleared() {
    let config = config(fast_retries(2));
    let device = SimDevice::open(&config).unwrap();
    let clock = device.clock();
    let (mut pump, handle) = PlaybackPump::new(device, &config).unwrap();

    pump.start().unwrap();
    clock.inject_suspend();
    clock.script_resume([ResumeOutcome::TryAgain; 10]);
    clock.fail_next_prepare();

    let err = pump.service().unwrap_err();
    assert!(matches!(err, PumpError::Unrecoverable(_)));
    assert_eq!(pump.state(), PlaybackState::Stopped);
    assert_eq!(handle.state(), PlaybackState::Stopped);
    assert!(!handle.is_running());
    assert_eq!(clock.resume_calls(), 3);
}

#[test]
fn disconnect_is_fatal_without_retry() {
    let config = config(RecoveryConfig::default());
    let device = SimDevice::open(&config).unwrap();
    let clock = device.clock();
    let (mut pump, _handle) = PlaybackPump::new(device, &config).unwrap();

    pump.start().unwrap();
    clock.disconnect();

    let err = pump.service().unwrap_err();
    assert!(matches!(err, PumpError::Unrecoverable(DeviceError::Disconnected(_))));
    assert_eq!(clock.prepare_calls(), 0);
    assert_eq!(pump.state(), PlaybackState::Stopped);
}
