//! Shared engine setup.

use opmix_audio::backend::DecodedSource;
use opmix_audio::{AudioConfig, AudioEngine, SoftwareBackend};
use opmix_core::NodeId;
use std::f32::consts::TAU;
use std::sync::Arc;

pub const RATE: u32 = 48000;

/// Live-tick size: one 60 fps frame at 48 kHz.
pub const TICK_FRAMES: usize = 800;

/// Two-second stereo file of constant 0.5.
pub const CLIP: &str = "clip.wav";
/// One-second mono file of constant 0.8.
pub const MUSIC: &str = "music.wav";
/// Mono file where every other sample is NaN.
pub const BROKEN: &str = "broken.wav";

pub fn sine(frames: usize, channels: u16, freq: f32) -> Vec<f32> {
    (0..frames)
        .flat_map(|i| {
            let s = (TAU * freq * i as f32 / RATE as f32).sin() * 0.5;
            std::iter::repeat(s).take(channels as usize)
        })
        .collect()
}

pub fn backend() -> Arc<SoftwareBackend> {
    let backend = Arc::new(SoftwareBackend::new());
    backend.register_source(
        CLIP,
        DecodedSource::from_interleaved(vec![0.5; RATE as usize * 2 * 2], RATE, 2),
    );
    backend.register_source(
        MUSIC,
        DecodedSource::from_interleaved(vec![0.8; RATE as usize], RATE, 1),
    );
    let broken = (0..RATE as usize)
        .map(|i| if i % 2 == 0 { f32::NAN } else { 0.3 })
        .collect();
    backend.register_source(BROKEN, DecodedSource::from_interleaved(broken, RATE, 1));
    backend
}

pub fn engine() -> (Arc<SoftwareBackend>, AudioEngine) {
    let backend = backend();
    let mut engine = AudioEngine::new(backend.clone(), AudioConfig::default());
    assert!(engine.initialize());
    (backend, engine)
}

pub fn node(name: &str) -> NodeId {
    NodeId::from_path(["scene", name])
}

/// Pull one live tick through the device path and return it.
pub fn tick(backend: &SoftwareBackend) -> Vec<f32> {
    let mut out = vec![0.0f32; TICK_FRAMES * 2];
    backend.render_output(&mut out, 2);
    out
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}
