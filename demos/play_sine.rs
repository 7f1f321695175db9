//! Play a sine tone on the default output device until Enter is pressed.
//!
//! Run with: cargo run --example play_sine --features cpal_sink [-- <wake mode>]
//!
//! The wake mode is one of `event` (default), `poll` or `callback`.

use std::io;
use std::time::Duration;

use tonepump::{CpalSession, PlaybackPump, SessionConfig, ToneGenerator, ToneMessage, WakeMode};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let wake = match std::env::args().nth(1).as_deref() {
        Some("poll") => WakeMode::Poll,
        Some("callback") => WakeMode::Callback,
        _ => WakeMode::Event,
    };

    let config = SessionConfig::default()
        .with_wake(wake)
        .with_buffer_time(Duration::from_millis(200))
        .with_period_time(Duration::from_millis(20))
        .with_tone(ToneGenerator::new(110.0).with_amplitude(0.25));

    let device = match CpalSession::open(&config) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("Could not open output device: {err}");
            return;
        }
    };
    println!("Using: {}", device.name());

    let (pump, mut handle) = PlaybackPump::new(device, &config).expect("pump setup failed");
    let worker = pump.spawn().expect("failed to spawn pump thread");

    println!("Playing 110Hz sine wave ({wake:?} wake)...");
    println!("Type a frequency and press Enter to retune, or just Enter to stop\n");

    let mut input = String::new();
    loop {
        input.clear();
        if io::stdin().read_line(&mut input).is_err() {
            break;
        }
        match input.trim().parse::<f64>() {
            Ok(freq) => {
                if handle.send(ToneMessage::SetFrequency(freq)).is_err() {
                    eprintln!("Tone queue full, try again");
                }
            }
            Err(_) => break,
        }
        if !handle.is_running() {
            break;
        }
    }

    handle.stop();
    let (pump, result) = worker.join().expect("pump thread panicked");
    println!("Stopped: {result:?}");
    println!("{:?}", pump.report());
}
