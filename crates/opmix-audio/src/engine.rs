//! The owning context for the whole engine.

use crate::analysis::AudioAnalysis;
use crate::backend::AudioBackend;
use crate::config::AudioConfig;
use crate::mixdown::{ExportMixdown, ExportTargets, RecordingState};
use crate::orchestrator::{OperatorPlayback, PlaybackParams};
use crate::soundtrack::{SoundtrackClip, SoundtrackPlayer};
use crate::spatial::SpatialParams;
use crate::stream::StreamSettings;
use crate::topology::{Bus, MixerTopology};
use crate::waveform::Waveform;
use opmix_core::{FrameRate, NodeId, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Operator audio engine: topology, per-node playback, soundtrack, export
/// and analysis behind one object.
///
/// Per frame: call `update_*_operator` for every evaluated node, then
/// `complete_frame` once.
pub struct AudioEngine {
    topology: Arc<MixerTopology>,
    operators: OperatorPlayback,
    soundtrack: SoundtrackPlayer,
    mixdown: ExportMixdown,
    analysis: AudioAnalysis,
    config: AudioConfig,
}

impl AudioEngine {
    pub fn new(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> Self {
        info!("Creating audio engine");
        let topology = Arc::new(MixerTopology::new(backend, &config));
        Self {
            operators: OperatorPlayback::new(topology.clone(), StreamSettings::from(&config)),
            soundtrack: SoundtrackPlayer::new(topology.clone()),
            mixdown: ExportMixdown::new(topology.clone(), config.playback_source),
            analysis: AudioAnalysis::new(),
            topology,
            config,
        }
    }

    /// Bring up the topology (lazy; also happens on first use).
    pub fn initialize(&mut self) -> bool {
        let ready = self.topology.initialize();
        if ready {
            self.soundtrack.reload_streams();
        }
        ready
    }

    /// Release every stream and the buses. A later `initialize` retries.
    pub fn shutdown(&mut self) {
        self.operators.invalidate_streams();
        self.soundtrack.release_streams();
        self.topology.shutdown();
    }

    /// The output device changed: rebuild everything on the new device.
    pub fn on_device_changed(&mut self) {
        info!("Audio device changed, reinitializing");
        self.shutdown();
        if !self.initialize() {
            warn!("Audio unavailable after device change");
        }
    }

    pub fn topology(&self) -> &Arc<MixerTopology> {
        &self.topology
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        self.topology.backend()
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Apply a reloaded configuration. Bus settings go through the regular
    /// setters, so a muted bus will unmute to the new volume.
    pub fn apply_config(&mut self, config: AudioConfig) {
        for bus in Bus::ALL {
            let settings = config.bus(bus);
            self.topology.set_bus_volume(bus, settings.volume);
            self.topology.set_bus_mute(bus, settings.muted);
        }
        self.operators.set_settings(StreamSettings::from(&config));
        self.mixdown.set_playback_source(config.playback_source);
        self.config = config;
    }

    // Operator nodes

    #[allow(clippy::too_many_arguments)]
    pub fn update_stereo_operator(
        &mut self,
        id: NodeId,
        path: &Path,
        play: bool,
        stop: bool,
        volume: f32,
        mute: bool,
        pan: f32,
        speed: f32,
        seek: f32,
    ) {
        let params = PlaybackParams {
            play,
            stop,
            volume,
            mute,
            speed,
            seek,
        };
        self.operators.update_stereo(id, path, params, pan);
    }

    pub fn update_spatial_operator(
        &mut self,
        id: NodeId,
        path: &Path,
        params: PlaybackParams,
        spatial: SpatialParams,
    ) {
        self.operators.update_spatial(id, path, params, spatial);
    }

    /// End the frame: decide liveness and, when live, feed the global bus
    /// output to analysis.
    pub fn complete_frame(&mut self) {
        self.operators.complete_frame();
        if self.mixdown.is_recording() {
            return;
        }
        if let Some(global) = self.topology.bus(Bus::Global) {
            let mut recent = vec![0.0f32; crate::analysis::ANALYSIS_WINDOW * 2];
            if let Ok(n) = self.backend().peek_data(global, &mut recent) {
                self.analysis.push_interleaved(&recent[..n], 2);
            }
        }
    }

    pub fn pause_operator(&mut self, id: NodeId) -> bool {
        self.operators.pause_operator(id)
    }

    pub fn resume_operator(&mut self, id: NodeId) -> bool {
        self.operators.resume_operator(id)
    }

    pub fn unregister_operator(&mut self, id: NodeId) -> bool {
        self.operators.unregister(id)
    }

    pub fn operators(&self) -> &OperatorPlayback {
        &self.operators
    }

    pub fn is_operator_playing(&self, id: NodeId) -> bool {
        self.operators.is_playing(id)
    }

    pub fn is_operator_paused(&self, id: NodeId) -> bool {
        self.operators.is_paused(id)
    }

    pub fn operator_level(&self, id: NodeId) -> f32 {
        self.operators.level(id)
    }

    pub fn operator_waveform(&self, id: NodeId) -> Vec<f32> {
        self.operators.waveform(id)
    }

    pub fn operator_spectrum(&self, id: NodeId) -> Vec<f32> {
        self.operators.spectrum(id)
    }

    // Buses

    pub fn set_bus_volume(&mut self, bus: Bus, volume: f32) {
        self.config.bus_mut(bus).volume = volume;
        self.topology.set_bus_volume(bus, volume);
    }

    pub fn set_bus_mute(&mut self, bus: Bus, muted: bool) {
        self.config.bus_mut(bus).muted = muted;
        self.topology.set_bus_mute(bus, muted);
    }

    pub fn bus_level(&self, bus: Bus) -> f32 {
        self.topology.bus_level(bus)
    }

    // Soundtrack

    pub fn add_soundtrack_clip(&mut self, clip: SoundtrackClip) -> bool {
        self.soundtrack.add_clip(clip)
    }

    pub fn remove_soundtrack_clip(&mut self, id: Uuid) -> bool {
        self.soundtrack.remove_clip(id)
    }

    pub fn soundtrack(&self) -> &SoundtrackPlayer {
        &self.soundtrack
    }

    /// Follow the timeline with the soundtrack clips (live only).
    pub fn update_soundtrack(&mut self, time: f64, playing: bool) {
        if !self.mixdown.is_recording() {
            self.soundtrack.update(time, playing);
        }
    }

    // Analysis

    pub fn waveform(&self) -> Vec<f32> {
        self.analysis.waveform()
    }

    pub fn spectrum(&self) -> &[f32] {
        self.analysis.spectrum()
    }

    pub fn analyze_file_waveform(&self, path: &Path, samples_per_pixel: usize) -> Option<Waveform> {
        self.topology.analyze_waveform(path, samples_per_pixel)
    }

    // Export

    pub fn recording_state(&self) -> RecordingState {
        self.mixdown.state()
    }

    pub fn prepare_recording(&mut self, fps: FrameRate) -> Result<()> {
        let Self {
            mixdown,
            operators,
            soundtrack,
            analysis,
            ..
        } = self;
        mixdown.prepare_recording(
            fps,
            ExportTargets {
                operators,
                soundtrack,
                analysis,
            },
        )
    }

    pub fn get_full_mixdown_buffer(&mut self, frame_duration: f64, local_time: f64) -> Vec<f32> {
        let Self {
            mixdown,
            operators,
            soundtrack,
            analysis,
            ..
        } = self;
        mixdown.get_full_mixdown_buffer(
            frame_duration,
            local_time,
            ExportTargets {
                operators,
                soundtrack,
                analysis,
            },
        )
    }

    pub fn end_recording(&mut self, fps: FrameRate) {
        let Self {
            mixdown,
            operators,
            soundtrack,
            analysis,
            ..
        } = self;
        mixdown.end_recording(
            fps,
            ExportTargets {
                operators,
                soundtrack,
                analysis,
            },
        );
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if self.mixdown.is_recording() {
            let fps = FrameRate::default();
            self.end_recording(fps);
        }
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Attribute, DecodedSource, SoftwareBackend};

    fn engine() -> (Arc<SoftwareBackend>, AudioEngine) {
        let backend = Arc::new(SoftwareBackend::new());
        backend.register_source("a.wav", DecodedSource::from_interleaved(vec![0.5; 9600], 48000, 1));
        let engine = AudioEngine::new(backend.clone(), AudioConfig::default());
        (backend, engine)
    }

    #[test]
    fn test_device_change_reloads_everything() {
        let (backend, mut engine) = engine();
        let id = NodeId::from_path(["n"]);
        engine.add_soundtrack_clip(SoundtrackClip::new("a.wav", 0.0, 0.2));
        engine.update_stereo_operator(id, Path::new("a.wav"), true, false, 1.0, false, 0.0, 1.0, 0.0);
        assert_eq!(backend.handle_count(), 5);

        engine.on_device_changed();
        assert!(engine.topology().is_ready());
        // Buses and soundtrack are back; the operator reloads on its next update.
        assert_eq!(backend.handle_count(), 4);
        engine.update_stereo_operator(id, Path::new("a.wav"), true, false, 1.0, false, 0.0, 1.0, 0.0);
        assert_eq!(backend.handle_count(), 5);
        // Held trigger, no new edge: playback picks up where the device left it.
        assert!(engine.is_operator_playing(id));
    }

    #[test]
    fn test_apply_config_while_muted() {
        let (backend, mut engine) = engine();
        engine.initialize();
        engine.set_bus_mute(Bus::Operator, true);
        let mut config = engine.config().clone();
        config.operator.volume = 0.4;
        engine.apply_config(config);
        let handle = engine.topology().bus(Bus::Operator).unwrap();
        assert_eq!(backend.attribute(handle, Attribute::Volume).unwrap(), 0.0);
        engine.set_bus_mute(Bus::Operator, false);
        assert!((backend.attribute(handle, Attribute::Volume).unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_drop_releases_backend() {
        let (backend, mut engine) = engine();
        engine.initialize();
        drop(engine);
        assert_eq!(backend.handle_count(), 0);
        assert_eq!(backend.initialized_rate(), None);
    }
}
