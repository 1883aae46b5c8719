//! Per-node playback orchestration.
//!
//! Graph nodes call `update_stereo` / `update_spatial` once per frame with
//! their current inputs. The orchestrator keys state by `NodeId`, creates and
//! retires streams as the file input changes, turns trigger booleans into
//! rising edges, and pushes parameter changes down. After all nodes ran,
//! `complete_frame` mutes every node that did not call this frame.

use crate::analysis::{waveform_from_stereo, SpectrumAnalyzer, ANALYSIS_WINDOW, SPECTRUM_BINS};
use crate::liveness::LivenessSet;
use crate::spatial::SpatialParams;
use crate::stream::{OperatorStream, StreamKind, StreamSettings, TransportState};
use crate::topology::{Bus, MixerTopology};
use opmix_core::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-frame inputs shared by both node variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackParams {
    /// Rising edge starts playback.
    pub play: bool,
    /// Rising edge stops and rewinds.
    pub stop: bool,
    pub volume: f32,
    pub mute: bool,
    pub speed: f32,
    /// Seek target as a fraction of the duration.
    pub seek: f32,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            play: false,
            stop: false,
            volume: 1.0,
            mute: false,
            speed: 1.0,
            seek: 0.0,
        }
    }
}

struct OperatorEntry {
    stream: Option<OperatorStream>,
    /// Last requested file; `None` for empty or after invalidation.
    current_path: Option<PathBuf>,
    spatial: bool,
    play_latch: bool,
    stop_latch: bool,
    external_pause: bool,
    /// Went stale while externally paused; comes back `Paused`.
    resume_paused: bool,
    /// Transport to re-establish once the stream for this path reloads after
    /// invalidation.
    restore: Option<(PathBuf, TransportState)>,
    playing_before_export: bool,
}

impl OperatorEntry {
    fn new(spatial: bool) -> Self {
        Self {
            stream: None,
            current_path: None,
            spatial,
            play_latch: false,
            stop_latch: false,
            external_pause: false,
            resume_paused: false,
            restore: None,
            playing_before_export: false,
        }
    }
}

pub struct OperatorPlayback {
    topology: Arc<MixerTopology>,
    entries: HashMap<NodeId, OperatorEntry>,
    liveness: LivenessSet,
    settings: StreamSettings,
    exporting: bool,
    analyzer: Mutex<SpectrumAnalyzer>,
}

impl OperatorPlayback {
    pub fn new(topology: Arc<MixerTopology>, settings: StreamSettings) -> Self {
        Self {
            topology,
            entries: HashMap::new(),
            liveness: LivenessSet::new(),
            settings,
            exporting: false,
            analyzer: Mutex::new(SpectrumAnalyzer::new()),
        }
    }

    pub fn set_settings(&mut self, settings: StreamSettings) {
        self.settings = settings;
    }

    pub fn update_stereo(&mut self, id: NodeId, path: &Path, params: PlaybackParams, pan: f32) {
        self.update(id, path, params, StreamKind::Stereo { pan });
    }

    pub fn update_spatial(
        &mut self,
        id: NodeId,
        path: &Path,
        params: PlaybackParams,
        spatial: SpatialParams,
    ) {
        self.update(id, path, params, StreamKind::Spatial(spatial));
    }

    fn update(&mut self, id: NodeId, path: &Path, params: PlaybackParams, kind: StreamKind) {
        // 1. Heartbeat.
        self.liveness.mark(id);
        let spatial = kind.is_spatial();
        let entry = self.entries.entry(id).or_insert_with(|| {
            debug!(node = %id, spatial, "Tracking operator node");
            OperatorEntry::new(spatial)
        });

        // 2. Reload on file (or variant) change. Failed loads are not retried
        // until the path changes.
        let requested = (!path.as_os_str().is_empty()).then_some(path);
        if requested != entry.current_path.as_deref() || spatial != entry.spatial {
            entry.stream = None;
            entry.current_path = requested.map(Path::to_path_buf);
            entry.spatial = spatial;
            if let Some(path) = requested {
                entry.stream = load_stream(&self.topology, id, path, kind, self.settings);
            }
            if let (Some((previous, transport)), Some(stream)) =
                (entry.restore.take(), entry.stream.as_mut())
            {
                if requested == Some(previous.as_path()) {
                    match transport {
                        TransportState::Playing if !entry.external_pause => stream.play(),
                        TransportState::Playing | TransportState::Paused => stream.arm_paused(),
                        TransportState::Stopped => {}
                    }
                    debug!(node = %id, ?transport, "Restored operator transport after reload");
                }
            }
        }

        // 3. Edges. Latches update even without a stream; Play runs before Stop.
        let play_edge = params.play && !entry.play_latch;
        let stop_edge = params.stop && !entry.stop_latch;
        entry.play_latch = params.play;
        entry.stop_latch = params.stop;

        let Some(stream) = entry.stream.as_mut() else {
            return;
        };
        if play_edge || stop_edge {
            entry.resume_paused = false;
        }
        if play_edge {
            if entry.external_pause {
                stream.arm_paused();
            } else {
                stream.play();
            }
        }
        if stop_edge {
            stream.stop();
        }

        // 4. Parameters, each only when changed.
        let eps = self.settings.epsilon;
        if (params.volume - stream.volume()).abs() > eps || params.mute != stream.is_user_muted() {
            stream.set_volume(params.volume, params.mute);
        }
        match kind {
            StreamKind::Stereo { pan } => stream.set_pan(pan),
            StreamKind::Spatial(p) => stream.set_spatial(p),
        }
        stream.set_speed(params.speed);
        stream.seek_normalized(params.seek);
    }

    /// Decide liveness for the frame: nodes that called are un-staled, all
    /// others go stale. Must run after every node update of the frame.
    pub fn complete_frame(&mut self) {
        for (id, entry) in &mut self.entries {
            let live = self.liveness.contains(id);
            let Some(stream) = entry.stream.as_mut() else {
                continue;
            };
            let was_paused = stream.is_paused();
            if !stream.set_stale(!live, self.exporting) {
                continue;
            }
            debug!(node = %id, stale = !live, "Operator liveness changed");
            if self.exporting {
                continue;
            }
            if !live {
                entry.resume_paused = was_paused && entry.external_pause;
            } else if std::mem::take(&mut entry.resume_paused) && entry.external_pause {
                stream.arm_paused();
            }
        }
        self.liveness.clear();
    }

    /// Externally pause a node. Returns `false` for unknown nodes.
    pub fn pause_operator(&mut self, id: NodeId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.external_pause = true;
        if let Some(stream) = entry.stream.as_mut() {
            stream.pause();
        }
        true
    }

    pub fn resume_operator(&mut self, id: NodeId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.external_pause = false;
        if let Some(stream) = entry.stream.as_mut() {
            stream.resume();
        }
        true
    }

    /// Forget a node permanently, releasing its stream.
    pub fn unregister(&mut self, id: NodeId) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            debug!(node = %id, "Unregistered operator node");
        }
        removed
    }

    fn stream(&self, id: NodeId) -> Option<&OperatorStream> {
        self.entries.get(&id).and_then(|e| e.stream.as_ref())
    }

    pub fn is_tracked(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn has_stream(&self, id: NodeId) -> bool {
        self.stream(id).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_playing(&self, id: NodeId) -> bool {
        self.stream(id).is_some_and(OperatorStream::is_playing)
    }

    pub fn is_paused(&self, id: NodeId) -> bool {
        self.stream(id).is_some_and(OperatorStream::is_paused)
    }

    pub fn is_stale(&self, id: NodeId) -> bool {
        self.stream(id).is_some_and(OperatorStream::is_stale)
    }

    pub fn level(&self, id: NodeId) -> f32 {
        self.stream(id).map_or(0.0, OperatorStream::level)
    }

    pub fn effective_volume(&self, id: NodeId) -> f32 {
        self.stream(id).map_or(0.0, OperatorStream::effective_volume)
    }

    pub fn position_secs(&self, id: NodeId) -> f64 {
        self.stream(id).map_or(0.0, OperatorStream::position_secs)
    }

    /// Recent mono output of a node, empty without a stream.
    pub fn waveform(&self, id: NodeId) -> Vec<f32> {
        let Some(stream) = self.stream(id) else {
            return Vec::new();
        };
        let mut stereo = vec![0.0f32; ANALYSIS_WINDOW * 2];
        let n = stream.recent_output(&mut stereo);
        waveform_from_stereo(&stereo[..n])
    }

    /// Magnitude spectrum of a node's recent output.
    pub fn spectrum(&self, id: NodeId) -> Vec<f32> {
        let Some(stream) = self.stream(id) else {
            return vec![0.0; SPECTRUM_BINS];
        };
        let mut stereo = vec![0.0f32; ANALYSIS_WINDOW * 2];
        let n = stream.recent_output(&mut stereo);
        let mono: Vec<f32> = stereo[..n]
            .chunks_exact(2)
            .map(|f| (f[0] + f[1]) * 0.5)
            .collect();
        self.analyzer.lock().magnitudes(&mono)
    }

    pub fn is_exporting(&self) -> bool {
        self.exporting
    }

    /// Enter export mode: remember who was playing, rewind everything and
    /// mark every stream stale in the position-preserving export variant.
    pub fn prepare_for_export(&mut self) {
        self.exporting = true;
        for entry in self.entries.values_mut() {
            entry.playing_before_export = entry.stream.as_ref().is_some_and(|s| s.is_playing());
            if let Some(stream) = entry.stream.as_mut() {
                stream.prepare_for_export();
                stream.set_stale(true, true);
            }
        }
    }

    /// Leave export mode, restarting exactly the streams that were playing.
    pub fn end_export(&mut self) {
        self.exporting = false;
        for entry in self.entries.values_mut() {
            let Some(stream) = entry.stream.as_mut() else {
                continue;
            };
            if entry.playing_before_export {
                stream.restart_after_export();
            } else {
                stream.clear_export_level();
                if stream.is_playing() || stream.is_paused() {
                    stream.stop();
                }
            }
            entry.playing_before_export = false;
        }
    }

    /// Freeze every stream's meter reading for the current export frame.
    pub fn capture_export_levels(&mut self) {
        for stream in self.entries.values_mut().filter_map(|e| e.stream.as_mut()) {
            stream.capture_export_level();
        }
    }

    /// Drop every stream (e.g. before the device goes away). Nodes reload
    /// on their next update and get back to playing or paused if they were.
    pub fn invalidate_streams(&mut self) {
        for entry in self.entries.values_mut() {
            let transport = entry.stream.take().map(|s| s.transport());
            entry.restore = match (entry.current_path.take(), transport) {
                (Some(path), Some(t)) if t != TransportState::Stopped => Some((path, t)),
                _ => None,
            };
        }
    }

    /// Drop all nodes and streams.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.liveness = LivenessSet::new();
    }
}

fn load_stream(
    topology: &MixerTopology,
    id: NodeId,
    path: &Path,
    kind: StreamKind,
    settings: StreamSettings,
) -> Option<OperatorStream> {
    if !topology.initialize() {
        return None;
    }
    let bus = topology.bus(Bus::Operator)?;
    match OperatorStream::load(topology.backend().clone(), path, bus, kind, settings) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(node = %id, path = %path.display(), error = %e, "Failed to load operator audio");
            None
        }
    }
}
