//! Export-path pulls: resampling, channel mapping and NaN handling.

use crate::fixtures::{engine, sine, RATE};
use opmix_audio::backend::DecodedSource;
use opmix_audio::resample::{mix_finite, resample_into, Layout};
use opmix_audio::stream::StreamSettings;
use opmix_audio::{Bus, OperatorStream, StreamKind};
use std::path::Path;

fn load(engine: &opmix_audio::AudioEngine, path: &str) -> OperatorStream {
    let bus = engine.topology().bus(Bus::Operator).unwrap();
    OperatorStream::load(
        engine.backend().clone(),
        Path::new(path),
        bus,
        StreamKind::Stereo { pan: 0.0 },
        StreamSettings::default(),
    )
    .unwrap()
}

#[test]
fn render_audio_at_native_format_is_identity() {
    let (backend, engine) = engine();
    let input = sine(4800, 2, 440.0);
    backend.register_source("sine.wav", DecodedSource::from_interleaved(input.clone(), RATE, 2));
    let mut stream = load(&engine, "sine.wav");

    let mut out = vec![0.0f32; 4800 * 2];
    let written = stream.render_audio(0.0, 0.05, &mut out, RATE, 2);
    assert_eq!(written, 2400 * 2);
    assert_eq!(&out[..written], &input[..written]);
}

#[test]
fn render_audio_mono_upmix_duplicates() {
    let (backend, engine) = engine();
    let input = sine(4800, 1, 220.0);
    backend.register_source("mono.wav", DecodedSource::from_interleaved(input.clone(), RATE, 1));
    let mut stream = load(&engine, "mono.wav");

    let mut out = vec![0.0f32; 1000 * 2];
    let written = stream.render_audio(0.0, 1000.0 / RATE as f64, &mut out, RATE, 2);
    assert_eq!(written, 2000);
    for (frame, expected) in out.chunks_exact(2).zip(&input) {
        assert_eq!(frame[0], frame[1]);
        assert_eq!(frame[0], *expected);
    }
}

#[test]
fn render_audio_seeks_to_start_time() {
    let (backend, engine) = engine();
    let ramp: Vec<f32> = (0..RATE).map(|i| i as f32 / RATE as f32).collect();
    backend.register_source("ramp.wav", DecodedSource::from_interleaved(ramp.clone(), RATE, 1));
    let mut stream = load(&engine, "ramp.wav");

    let mut out = vec![0.0f32; 20];
    stream.render_audio(0.5, 10.0 / RATE as f64, &mut out, RATE, 2);
    assert_eq!(out[0], ramp[RATE as usize / 2]);
    assert_eq!(out[18], ramp[RATE as usize / 2 + 9]);
}

#[test]
fn resampler_halves_rate_by_reading_every_other_frame() {
    let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let mut out = vec![0.0f32; 8];
    let frames = resample_into(&input, Layout::new(96000, 1), &mut out, Layout::new(48000, 1));
    assert_eq!(frames, 8);
    assert_eq!(out, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
}

#[test]
fn nan_contribution_leaves_other_contributor() {
    let mut dst = vec![0.25f32; 6];
    mix_finite(
        &mut dst,
        &[f32::NAN, 0.5, f32::INFINITY, f32::NAN, 0.0, f32::NEG_INFINITY],
        1.0,
    );
    assert_eq!(dst, vec![0.25, 0.75, 0.25, 0.25, 0.25, 0.25]);
}

#[test]
fn mixed_contribution_is_scaled_by_gain() {
    let mut dst = vec![0.0f32; 3];
    mix_finite(&mut dst, &[1.0, -0.5, f32::NAN], 0.5);
    assert_eq!(dst, vec![0.5, -0.25, 0.0]);
}
