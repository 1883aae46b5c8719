//! Trigger edges, external pause and gain composition.

use crate::fixtures::{engine, node, peak, tick, CLIP};
use glam::Vec3;
use opmix_audio::{AudioEngine, Bus, PlaybackParams, SpatialParams};
use opmix_core::NodeId;
use proptest::prelude::*;
use std::path::Path;

fn call(engine: &mut AudioEngine, id: NodeId, params: PlaybackParams) {
    engine.update_stereo_operator(
        id,
        Path::new(CLIP),
        params.play,
        params.stop,
        params.volume,
        params.mute,
        0.0,
        params.speed,
        params.seek,
    );
}

fn triggers(play: bool, stop: bool) -> PlaybackParams {
    PlaybackParams {
        play,
        stop,
        ..Default::default()
    }
}

#[test]
fn held_triggers_fire_once_per_rising_edge() {
    let (backend, mut engine) = engine();
    let a = node("a");

    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.is_operator_playing(a));

    // Stop rises while play is still held.
    call(&mut engine, a, triggers(true, true));
    engine.complete_frame();
    assert!(!engine.is_operator_playing(a));

    for _ in 0..5 {
        call(&mut engine, a, triggers(true, true));
        engine.complete_frame();
        tick(&backend);
        assert!(!engine.is_operator_playing(a));
    }

    // Re-raise play; stop stays held so it cannot fire again.
    call(&mut engine, a, triggers(false, true));
    call(&mut engine, a, triggers(true, true));
    engine.complete_frame();
    assert!(engine.is_operator_playing(a));
    for _ in 0..5 {
        call(&mut engine, a, triggers(true, true));
        engine.complete_frame();
        tick(&backend);
    }
    assert!(engine.is_operator_playing(a));
    assert!(engine.operators().position_secs(a) > 0.0);

    call(&mut engine, a, triggers(true, false));
    call(&mut engine, a, triggers(true, true));
    engine.complete_frame();
    assert!(!engine.is_operator_playing(a));
    assert_eq!(engine.operators().position_secs(a), 0.0);
}

#[test]
fn stopped_stream_is_silent_on_the_operator_bus() {
    let (backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(peak(&tick(&backend)) > 0.4);

    call(&mut engine, a, triggers(true, true));
    engine.complete_frame();
    assert_eq!(peak(&tick(&backend)), 0.0);
}

#[test]
fn paused_then_stale_resumes_paused() {
    let (backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    tick(&backend);
    assert!(engine.pause_operator(a));
    assert!(engine.is_operator_paused(a));

    // Drop out for a frame, then come back with a fresh play edge.
    engine.complete_frame();
    call(&mut engine, a, triggers(false, false));
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.is_operator_paused(a));
    assert!(!engine.is_operator_playing(a));
    assert_eq!(engine.operator_level(a), 0.0);

    assert!(engine.resume_operator(a));
    assert!(engine.is_operator_playing(a));
}

#[test]
fn paused_then_stale_returns_paused_with_play_held() {
    let (backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.pause_operator(a));

    // Skip one frame entirely, then keep holding play: no new edge.
    engine.complete_frame();
    assert!(!engine.is_operator_paused(a));
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.is_operator_paused(a));
    assert!(!engine.is_operator_playing(a));
    assert_eq!(peak(&tick(&backend)), 0.0);

    assert!(engine.resume_operator(a));
    assert!(engine.is_operator_playing(a));
    assert!(peak(&tick(&backend)) > 0.0);
}

#[test]
fn pause_unknown_node_reports_false() {
    let (_backend, mut engine) = engine();
    assert!(!engine.pause_operator(node("ghost")));
    assert!(!engine.resume_operator(node("ghost")));
}

#[test]
fn unmute_after_stale_uses_current_volume() {
    let (_backend, mut engine) = engine();
    let a = node("a");
    let loud = PlaybackParams {
        play: true,
        volume: 0.7,
        ..Default::default()
    };
    call(&mut engine, a, loud);
    engine.complete_frame();
    assert!((engine.operators().effective_volume(a) - 0.7).abs() < 1e-6);

    engine.complete_frame();
    assert!(engine.operators().is_stale(a));
    assert_eq!(engine.operators().effective_volume(a), 0.0);

    let quiet = PlaybackParams { volume: 0.3, ..loud };
    call(&mut engine, a, quiet);
    engine.complete_frame();
    assert!(!engine.operators().is_stale(a));
    assert!((engine.operators().effective_volume(a) - 0.3).abs() < 1e-6);
}

#[test]
fn bus_mute_restores_configured_volume() {
    let (_backend, mut engine) = engine();
    engine.set_bus_volume(Bus::Operator, 0.6);
    engine.set_bus_mute(Bus::Operator, true);
    assert_eq!(engine.topology().bus_volume(Bus::Operator), 0.0);
    engine.set_bus_mute(Bus::Operator, false);
    assert!((engine.topology().bus_volume(Bus::Operator) - 0.6).abs() < 1e-6);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn effective_volume_composes_mute_and_stale(
        volume in 0.0f32..=1.0,
        mute in any::<bool>(),
        stale in any::<bool>(),
    ) {
        let (_backend, mut engine) = engine();
        let a = node("a");
        call(&mut engine, a, PlaybackParams { play: true, volume, mute, ..Default::default() });
        engine.complete_frame();
        if stale {
            engine.complete_frame();
        }
        prop_assert_eq!(engine.operators().is_stale(a), stale);
        // Changes within the parameter epsilon are not pushed.
        let expected = if mute || stale { 0.0 } else { volume };
        prop_assert!((engine.operators().effective_volume(a) - expected).abs() <= 1.001e-3);
    }
}

#[test]
fn spatial_node_pushes_placement_only_on_change() {
    let (backend, mut engine) = engine();
    let a = node("spatial");
    let mut spatial = SpatialParams::default();
    spatial.source.position = Vec3::new(2.0, 0.0, -1.0);

    engine.update_spatial_operator(a, Path::new(CLIP), triggers(true, false), spatial);
    engine.complete_frame();
    assert!(engine.is_operator_playing(a));
    let applied = backend.applied_3d_count();

    engine.update_spatial_operator(a, Path::new(CLIP), triggers(true, false), spatial);
    assert_eq!(backend.applied_3d_count(), applied);

    spatial.source.position.x = 5.0;
    engine.update_spatial_operator(a, Path::new(CLIP), triggers(true, false), spatial);
    assert_eq!(backend.applied_3d_count(), applied + 1);

    let sources: Vec<_> = (0..64)
        .map(opmix_audio::backend::Handle::from_raw)
        .filter_map(|h| backend.source_3d(h))
        .collect();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].position, Vec3::new(5.0, 0.0, -1.0));
}

#[test]
fn device_change_reloads_streams_on_next_update() {
    let (backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert_eq!(backend.handle_count(), 4);

    engine.on_device_changed();
    assert!(engine.topology().is_ready());
    assert!(!engine.operators().has_stream(a));
    assert_eq!(backend.handle_count(), 3);

    // Play stays held across the change; the stream comes back playing.
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.operators().has_stream(a));
    assert!(engine.is_operator_playing(a));
    assert!(peak(&tick(&backend)) > 0.0);
}

#[test]
fn device_change_keeps_external_pause() {
    let (_backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.pause_operator(a));

    engine.on_device_changed();
    call(&mut engine, a, triggers(true, false));
    engine.complete_frame();
    assert!(engine.is_operator_paused(a));
    assert!(engine.resume_operator(a));
    assert!(engine.is_operator_playing(a));
}
