//! Export sessions driven through the engine.

use crate::fixtures::{engine, node, peak, tick, BROKEN, CLIP, MUSIC, RATE};
use opmix_audio::{
    AudioConfig, AudioEngine, Bus, PlaybackSource, RecordingState, SoundtrackClip,
};
use opmix_core::{FrameRate, NodeId};
use std::path::Path;

const FRAME: f64 = 1.0 / 30.0;

fn call(engine: &mut AudioEngine, id: NodeId, path: &str, play: bool) {
    engine.update_stereo_operator(id, Path::new(path), play, false, 1.0, false, 0.0, 1.0, 0.0);
}

fn live_soundtrack_peak() -> f32 {
    let (backend, mut engine) = engine();
    assert!(engine.add_soundtrack_clip(SoundtrackClip::new(MUSIC, 0.0, 1.0)));
    engine.update_soundtrack(0.0, true);
    peak(&tick(&backend))
}

#[test]
fn half_volume_clip_exports_at_half_live_peak() {
    let live = live_soundtrack_peak();
    assert!((live - 0.8).abs() < 1e-6);

    let (_backend, mut engine) = engine();
    let clip = SoundtrackClip::new(MUSIC, 0.0, 1.0).with_volume(0.5);
    assert!(engine.add_soundtrack_clip(clip));
    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    assert_eq!(engine.recording_state(), RecordingState::Recording);

    for i in 0..3 {
        let buffer = engine.get_full_mixdown_buffer(FRAME, i as f64 * FRAME);
        assert_eq!(buffer.len(), 1600 * 2);
        assert!((peak(&buffer) - live * 0.5).abs() < 1e-5);
    }
    engine.end_recording(FrameRate::FPS_30);
    assert_eq!(engine.recording_state(), RecordingState::Idle);
    assert!(!engine.soundtrack().is_detached());
}

#[test]
fn end_recording_restores_playing_set() {
    let (_backend, mut engine) = engine();
    let playing = node("playing");
    let idle = node("idle");
    call(&mut engine, playing, CLIP, true);
    call(&mut engine, idle, CLIP, false);
    engine.complete_frame();
    assert!(engine.is_operator_playing(playing));
    assert!(!engine.is_operator_playing(idle));

    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    assert!(!engine.is_operator_playing(playing));
    assert!(!engine.topology().is_global_playing());
    for i in 0..3 {
        engine.get_full_mixdown_buffer(FRAME, i as f64 * FRAME);
    }
    engine.end_recording(FrameRate::FPS_30);

    assert!(engine.is_operator_playing(playing));
    assert!(!engine.is_operator_playing(idle));
    assert!(engine.topology().is_global_playing());
    assert_eq!(engine.operators().position_secs(playing), 0.0);
}

#[test]
fn stale_during_export_keeps_position() {
    let (_backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, CLIP, true);
    engine.complete_frame();

    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    call(&mut engine, a, CLIP, false);
    call(&mut engine, a, CLIP, true);
    engine.complete_frame();
    assert!(engine.is_operator_playing(a));

    let buffer = engine.get_full_mixdown_buffer(FRAME, 0.0);
    assert!((peak(&buffer) - 0.5).abs() < 1e-6);
    let position = engine.operators().position_secs(a);
    assert!(position > 0.0);

    // Not evaluated this frame: muted, but the transport is left alone.
    engine.complete_frame();
    assert!(engine.operators().is_stale(a));
    assert_eq!(engine.operators().position_secs(a), position);
    assert!(engine.is_operator_playing(a));

    engine.end_recording(FrameRate::FPS_30);
}

#[test]
fn global_volume_scales_operators_like_live() {
    let (backend, mut engine) = engine();
    engine.set_bus_volume(Bus::Global, 0.5);
    let a = node("a");
    call(&mut engine, a, CLIP, true);
    engine.complete_frame();
    let live = peak(&tick(&backend));
    assert!((live - 0.25).abs() < 1e-6);

    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    call(&mut engine, a, CLIP, false);
    call(&mut engine, a, CLIP, true);
    engine.complete_frame();
    let buffer = engine.get_full_mixdown_buffer(FRAME, 0.0);
    assert!((peak(&buffer) - live).abs() < 1e-6);
    engine.end_recording(FrameRate::FPS_30);
}

#[test]
fn nan_operator_does_not_poison_mixdown() {
    let (_backend, mut engine) = engine();
    assert!(engine.add_soundtrack_clip(SoundtrackClip::new(MUSIC, 0.0, 1.0).with_volume(0.5)));
    let a = node("broken");

    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    call(&mut engine, a, BROKEN, true);
    engine.complete_frame();
    assert!(engine.is_operator_playing(a));

    let buffer = engine.get_full_mixdown_buffer(FRAME, 0.0);
    assert!(buffer.iter().all(|s| s.is_finite()));
    assert!(buffer.iter().all(|&s| s >= 0.4 - 1e-6));
    engine.end_recording(FrameRate::FPS_30);
}

#[test]
fn external_source_skips_soundtrack_only() {
    let backend = crate::fixtures::backend();
    let config = AudioConfig {
        playback_source: PlaybackSource::ExternalDevice,
        ..AudioConfig::default()
    };
    let mut engine = AudioEngine::new(backend, config);
    assert!(engine.add_soundtrack_clip(SoundtrackClip::new(MUSIC, 0.0, 1.0)));
    let a = node("a");

    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    call(&mut engine, a, CLIP, true);
    engine.complete_frame();
    let buffer = engine.get_full_mixdown_buffer(FRAME, 0.0);
    assert!((peak(&buffer) - 0.5).abs() < 1e-6);
    engine.end_recording(FrameRate::FPS_30);
}

#[test]
fn soundtrack_bus_volume_scales_export() {
    let (_backend, mut engine) = engine();
    engine.set_bus_volume(Bus::Soundtrack, 0.5);
    assert!(engine.add_soundtrack_clip(SoundtrackClip::new(MUSIC, 0.0, 1.0)));
    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    let buffer = engine.get_full_mixdown_buffer(FRAME, 0.0);
    assert!((peak(&buffer) - 0.4).abs() < 1e-6);

    // Outside the clip window nothing is mixed.
    let after = engine.get_full_mixdown_buffer(FRAME, 1.5);
    assert_eq!(peak(&after), 0.0);
    engine.end_recording(FrameRate::FPS_30);
}

#[test]
fn nested_prepare_is_a_no_op() {
    let (_backend, mut engine) = engine();
    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    engine.get_full_mixdown_buffer(FRAME, 0.0);
    engine.prepare_recording(FrameRate::FPS_30).unwrap();
    assert_eq!(engine.recording_state(), RecordingState::Recording);
    engine.end_recording(FrameRate::FPS_30);
    engine.end_recording(FrameRate::FPS_30);
    assert_eq!(engine.recording_state(), RecordingState::Idle);
}

#[test]
fn mixdown_length_follows_topology_rate() {
    let (_backend, mut engine) = engine();
    engine.prepare_recording(FrameRate::FPS_24).unwrap();
    let buffer = engine.get_full_mixdown_buffer(1.0 / 24.0, 0.0);
    assert_eq!(buffer.len(), (RATE as usize / 24) * 2);
    let tiny = engine.get_full_mixdown_buffer(0.0, 0.0);
    assert_eq!(tiny.len(), 2);
    engine.end_recording(FrameRate::FPS_24);
}
