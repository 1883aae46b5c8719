//! Frame-by-frame liveness of operator nodes.

use crate::fixtures::{engine, node, tick, CLIP};
use opmix_audio::AudioEngine;
use opmix_core::NodeId;
use proptest::prelude::*;
use std::path::Path;

fn call(engine: &mut AudioEngine, id: NodeId, play: bool) {
    engine.update_stereo_operator(id, Path::new(CLIP), play, false, 1.0, false, 0.0, 1.0, 0.0);
}

#[test]
fn two_second_file_goes_stale_and_waits_for_new_edge() {
    let (backend, mut engine) = engine();
    let a = node("a");

    for _ in 0..10 {
        call(&mut engine, a, true);
        engine.complete_frame();
        tick(&backend);
    }
    assert!(engine.is_operator_playing(a));
    assert!(engine.operators().position_secs(a) > 0.0);

    // Frame 10: A is not evaluated.
    engine.complete_frame();
    assert!(!engine.is_operator_playing(a));
    assert_eq!(engine.operators().position_secs(a), 0.0);

    for _ in 11..20 {
        engine.complete_frame();
        tick(&backend);
    }
    assert!(!engine.is_operator_playing(a));

    // Frame 20: called again without a rising edge.
    call(&mut engine, a, false);
    engine.complete_frame();
    tick(&backend);
    assert!(!engine.is_operator_playing(a));
    assert_eq!(engine.operators().position_secs(a), 0.0);

    call(&mut engine, a, true);
    engine.complete_frame();
    assert!(engine.is_operator_playing(a));
}

#[test]
fn held_play_does_not_restart_after_staleness() {
    let (_backend, mut engine) = engine();
    let a = node("a");

    call(&mut engine, a, true);
    engine.complete_frame();
    engine.complete_frame();
    assert!(!engine.is_operator_playing(a));

    call(&mut engine, a, true);
    engine.complete_frame();
    assert!(!engine.is_operator_playing(a));
}

#[test]
fn unregistered_node_is_forgotten() {
    let (_backend, mut engine) = engine();
    let a = node("a");
    call(&mut engine, a, true);
    engine.complete_frame();
    assert!(engine.unregister_operator(a));
    assert!(!engine.operators().is_tracked(a));
    assert!(!engine.is_operator_playing(a));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn omitted_node_stops_and_rewinds(presence in prop::collection::vec(any::<[bool; 3]>(), 1..24)) {
        let (backend, mut engine) = engine();
        let ids = [node("x"), node("y"), node("z")];

        for frame in &presence {
            let was_playing: Vec<bool> = ids.iter().map(|&id| engine.is_operator_playing(id)).collect();
            for (&id, &present) in ids.iter().zip(frame) {
                if present {
                    call(&mut engine, id, true);
                }
            }
            engine.complete_frame();

            for ((&id, &present), &before) in ids.iter().zip(frame).zip(&was_playing) {
                if !present {
                    prop_assert!(!engine.is_operator_playing(id));
                    prop_assert_eq!(engine.operators().position_secs(id), 0.0);
                } else if before {
                    prop_assert!(engine.is_operator_playing(id));
                }
            }
            tick(&backend);
        }
    }
}
