//! Offline export mixdown.
//!
//! `Idle → Recording → Idle`. While recording the realtime Global bus is
//! paused and soundtrack streams are detached, so every frame's audio is
//! pulled deterministically: soundtrack clips are read directly and
//! resampled into the buffer, then the Operator bus is pulled and added.

use crate::analysis::AudioAnalysis;
use crate::config::PlaybackSource;
use crate::orchestrator::OperatorPlayback;
use crate::resample::{mix_finite, pull_resampled, Layout};
use crate::soundtrack::SoundtrackPlayer;
use crate::topology::{Bus, MixerTopology};
use opmix_core::{FrameRate, OpMixError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Export output is always interleaved stereo.
pub const EXPORT_CHANNELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
}

#[derive(Debug, Clone, Copy)]
struct ExportSession {
    global_volume: f32,
    global_was_playing: bool,
    frame_index: u64,
    fps: FrameRate,
    external_source: bool,
}

/// The parts of the engine a mixdown session borrows.
pub struct ExportTargets<'a> {
    pub operators: &'a mut OperatorPlayback,
    pub soundtrack: &'a mut SoundtrackPlayer,
    pub analysis: &'a mut AudioAnalysis,
}

pub struct ExportMixdown {
    topology: Arc<MixerTopology>,
    session: Option<ExportSession>,
    playback_source: PlaybackSource,
}

impl ExportMixdown {
    pub fn new(topology: Arc<MixerTopology>, playback_source: PlaybackSource) -> Self {
        Self {
            topology,
            session: None,
            playback_source,
        }
    }

    pub fn state(&self) -> RecordingState {
        if self.session.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Takes effect at the next `prepare_recording`.
    pub fn set_playback_source(&mut self, source: PlaybackSource) {
        self.playback_source = source;
    }

    /// Frames produced in the current session.
    pub fn frames_rendered(&self) -> u64 {
        self.session.map_or(0, |s| s.frame_index)
    }

    /// Start an export session. A second call while recording is a no-op.
    ///
    /// Fails only when the mixer topology cannot be brought up, so the
    /// caller can abort the export instead of writing silence.
    pub fn prepare_recording(&mut self, fps: FrameRate, targets: ExportTargets<'_>) -> Result<()> {
        if self.session.is_some() {
            debug!("Export already recording, ignoring prepare");
            return Ok(());
        }
        if !self.topology.initialize() {
            return Err(OpMixError::NotInitialized);
        }

        let global_was_playing = self.topology.is_global_playing();
        let global_volume = self.topology.bus_volume(Bus::Global);
        self.topology.pause_global();

        targets.analysis.reset();
        targets.soundtrack.detach_for_export();
        targets.operators.prepare_for_export();

        let external_source = self.playback_source == PlaybackSource::ExternalDevice;
        self.session = Some(ExportSession {
            global_volume,
            global_was_playing,
            frame_index: 0,
            fps,
            external_source,
        });
        info!(%fps, external_source, "Export recording started");
        Ok(())
    }

    /// Mix one export frame: `round(frame_duration * rate)` stereo frames
    /// (at least one) for timeline time `local_time`.
    pub fn get_full_mixdown_buffer(
        &mut self,
        frame_duration: f64,
        local_time: f64,
        targets: ExportTargets<'_>,
    ) -> Vec<f32> {
        let sample_rate = self.topology.sample_rate().unwrap_or(48000);
        let frames = ((frame_duration.max(0.0) * sample_rate as f64).round() as usize).max(1);
        let mut buffer = vec![0.0f32; frames * EXPORT_CHANNELS];

        let Some(session) = self.session.as_mut() else {
            warn!("Mixdown requested outside of a recording session");
            return buffer;
        };
        let out_layout = Layout::new(sample_rate, EXPORT_CHANNELS);
        let backend = self.topology.backend();

        if !session.external_source {
            let bus_gain = self.topology.bus_volume(Bus::Soundtrack) * session.global_volume;
            for source in targets.soundtrack.export_sources() {
                if !source.contains(local_time) {
                    continue;
                }
                let in_layout = Layout::new(source.sample_rate, source.channels as usize);
                let offset = local_time - source.start;
                let frame = (offset * source.sample_rate as f64) as u64;
                if let Err(e) = pull_resampled(
                    backend.as_ref(),
                    source.handle,
                    frame,
                    in_layout,
                    &mut buffer,
                    out_layout,
                    source.volume * bus_gain,
                ) {
                    warn!(error = %e, code = e.code.code(), "Soundtrack export pull failed");
                }
            }
        }

        if let Some(operator_bus) = self.topology.bus(Bus::Operator) {
            let mut operators = vec![0.0f32; frames * EXPORT_CHANNELS];
            match backend.read_data(operator_bus, &mut operators) {
                Ok(read) => mix_finite(&mut buffer, &operators[..read], session.global_volume),
                Err(e) => warn!(error = %e, code = e.code.code(), "Operator bus export read failed"),
            }
        }

        targets.operators.capture_export_levels();
        targets.analysis.push_interleaved(&buffer, EXPORT_CHANNELS);
        session.frame_index += 1;
        buffer
    }

    /// End the session and hand audio back to live playback. No-op when idle.
    pub fn end_recording(&mut self, fps: FrameRate, targets: ExportTargets<'_>) {
        let Some(session) = self.session.take() else {
            return;
        };
        if fps != session.fps {
            debug!(started = %session.fps, ended = %fps, "Export ended with a different frame rate");
        }

        targets.soundtrack.reattach_after_export();
        targets.operators.end_export();
        targets.analysis.reset();

        // Re-apply in case configuration changed while exporting.
        let volume = self.topology.configured_bus_volume(Bus::Global);
        self.topology.set_bus_volume(Bus::Global, volume);
        if session.global_was_playing {
            self.topology.play_global();
        }
        info!(
            frames = session.frame_index,
            global_volume = session.global_volume,
            "Export recording finished"
        );
    }
}
