//! Background soundtrack clips on the Soundtrack bus.
//!
//! Live, `update` keeps each clip's stream in step with the timeline. For
//! export the streams are detached from the bus so the mixdown can read them
//! directly, then re-attached afterwards.

use crate::backend::{Attribute, AudioBackend, ChannelFlags, Handle, StreamFlags};
use crate::topology::{Bus, MixerTopology};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Position drift tolerated before a playing clip is re-seeked.
const RESYNC_THRESHOLD_SECS: f64 = 0.1;

/// A soundtrack file placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundtrackClip {
    pub id: Uuid,
    pub path: PathBuf,
    /// Timeline start in seconds.
    pub start: f64,
    /// Length on the timeline in seconds.
    pub length: f64,
    /// Authored clip volume.
    pub volume: f32,
}

impl SoundtrackClip {
    pub fn new(path: impl Into<PathBuf>, start: f64, length: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            start,
            length,
            volume: 1.0,
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn end(&self) -> f64 {
        self.start + self.length
    }

    /// Whether `time` falls in `[start, start + length)`.
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end()
    }
}

/// What the mixdown needs to pull one clip directly.
#[derive(Debug, Clone, Copy)]
pub struct ExportSource {
    pub handle: Handle,
    pub start: f64,
    pub length: f64,
    pub volume: f32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl ExportSource {
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.start + self.length
    }
}

#[derive(Debug, Clone, Copy)]
struct SavedAttributes {
    volume: f32,
    frequency: f32,
    no_ramp: f32,
}

struct ClipStream {
    handle: Handle,
    sample_rate: u32,
    channels: u16,
    /// Unpaused on the bus.
    active: bool,
    saved: Option<SavedAttributes>,
}

struct SoundtrackEntry {
    clip: SoundtrackClip,
    stream: Option<ClipStream>,
}

pub struct SoundtrackPlayer {
    topology: Arc<MixerTopology>,
    entries: Vec<SoundtrackEntry>,
    detached: bool,
}

impl SoundtrackPlayer {
    pub fn new(topology: Arc<MixerTopology>) -> Self {
        Self {
            topology,
            entries: Vec::new(),
            detached: false,
        }
    }

    fn backend(&self) -> &Arc<dyn AudioBackend> {
        self.topology.backend()
    }

    /// Add a clip and open its stream. The clip is kept even if the stream
    /// fails to open, so a later reload can retry it.
    pub fn add_clip(&mut self, clip: SoundtrackClip) -> bool {
        let stream = self.open(&clip);
        let loaded = stream.is_some();
        self.entries.push(SoundtrackEntry { clip, stream });
        loaded
    }

    fn open(&self, clip: &SoundtrackClip) -> Option<ClipStream> {
        if !self.topology.initialize() {
            return None;
        }
        let bus = self.topology.bus(Bus::Soundtrack)?;
        let backend = self.backend();
        let flags = StreamFlags {
            decode: true,
            float: true,
            mono: false,
        };
        let handle = match backend.create_file_stream(&clip.path, flags) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, code = e.code.code(), path = %clip.path.display(), "Failed to open soundtrack");
                return None;
            }
        };
        let setup = || {
            let info = backend.channel_info(handle)?;
            backend.mixer_add_channel(
                bus,
                handle,
                ChannelFlags {
                    paused: true,
                    buffered: false,
                },
            )?;
            backend.set_attribute(handle, Attribute::Volume, clip.volume.max(0.0))?;
            Ok::<_, crate::backend::BackendError>(info)
        };
        match setup() {
            Ok(info) => {
                debug!(clip = %clip.id, path = %clip.path.display(), "Soundtrack clip loaded");
                Some(ClipStream {
                    handle,
                    sample_rate: info.sample_rate,
                    channels: info.channels,
                    active: false,
                    saved: None,
                })
            }
            Err(e) => {
                warn!(error = %e, code = e.code.code(), path = %clip.path.display(), "Failed to attach soundtrack");
                let _ = backend.free_channel(handle);
                None
            }
        }
    }

    pub fn remove_clip(&mut self, id: Uuid) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.clip.id == id) else {
            return false;
        };
        let entry = self.entries.remove(index);
        if let Some(stream) = entry.stream {
            let _ = self.backend().free_channel(stream.handle);
        }
        true
    }

    pub fn clear(&mut self) {
        self.release_streams();
        self.entries.clear();
    }

    pub fn clips(&self) -> impl Iterator<Item = &SoundtrackClip> {
        self.entries.iter().map(|e| &e.clip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn loaded_count(&self) -> usize {
        self.entries.iter().filter(|e| e.stream.is_some()).count()
    }

    /// Follow the timeline: play clips under `time`, pause the rest.
    pub fn update(&mut self, time: f64, playing: bool) {
        if self.detached {
            return;
        }
        let backend = self.topology.backend().clone();
        let mut changed = false;
        for entry in &mut self.entries {
            let Some(stream) = entry.stream.as_mut() else {
                continue;
            };
            let wanted = playing && entry.clip.contains(time);
            if wanted {
                let offset = time - entry.clip.start;
                let position = backend
                    .position(stream.handle)
                    .map(|f| f as f64 / stream.sample_rate.max(1) as f64)
                    .unwrap_or(f64::MAX);
                if !stream.active || (position - offset).abs() > RESYNC_THRESHOLD_SECS {
                    let frame = (offset * stream.sample_rate as f64) as u64;
                    if let Err(e) = backend.set_position(stream.handle, frame, true) {
                        warn!(error = %e, code = e.code.code(), clip = %entry.clip.id, "Soundtrack seek failed");
                    }
                }
                if !stream.active {
                    if let Err(e) = backend.channel_unpause(stream.handle) {
                        warn!(error = %e, code = e.code.code(), clip = %entry.clip.id, "Soundtrack unpause failed");
                    }
                    stream.active = true;
                    changed = true;
                }
            } else if stream.active {
                if let Err(e) = backend.channel_pause(stream.handle) {
                    warn!(error = %e, code = e.code.code(), clip = %entry.clip.id, "Soundtrack pause failed");
                }
                stream.active = false;
                changed = true;
            }
        }
        if changed {
            self.topology.nudge(Bus::Soundtrack);
        }
    }

    /// Detach every clip from the bus for direct reads: native frequency,
    /// authored volume, no ramping. Failures are logged and skipped.
    pub fn detach_for_export(&mut self) {
        if self.detached {
            return;
        }
        let backend = self.topology.backend().clone();
        for entry in &mut self.entries {
            let Some(stream) = entry.stream.as_mut() else {
                continue;
            };
            let h = stream.handle;
            stream.saved = Some(SavedAttributes {
                volume: backend.attribute(h, Attribute::Volume).unwrap_or(entry.clip.volume),
                frequency: backend
                    .attribute(h, Attribute::Frequency)
                    .unwrap_or(stream.sample_rate as f32),
                no_ramp: backend.attribute(h, Attribute::NoRamp).unwrap_or(0.0),
            });
            let steps = [
                backend.mixer_remove_channel(h),
                backend.set_attribute(h, Attribute::Frequency, stream.sample_rate as f32),
                backend.set_attribute(h, Attribute::Volume, entry.clip.volume.max(0.0)),
                backend.set_attribute(h, Attribute::NoRamp, 1.0),
            ];
            for e in steps.into_iter().filter_map(Result::err) {
                warn!(error = %e, code = e.code.code(), clip = %entry.clip.id, "Soundtrack export detach step failed");
            }
            stream.active = false;
        }
        self.detached = true;
    }

    /// Put every clip back on the bus, paused, with its saved attributes.
    /// The next `update` re-seeks them.
    pub fn reattach_after_export(&mut self) {
        if !self.detached {
            return;
        }
        self.detached = false;
        let Some(bus) = self.topology.bus(Bus::Soundtrack) else {
            return;
        };
        let backend = self.topology.backend().clone();
        for entry in &mut self.entries {
            let Some(stream) = entry.stream.as_mut() else {
                continue;
            };
            let h = stream.handle;
            let mut steps = vec![backend.mixer_add_channel(
                bus,
                h,
                ChannelFlags {
                    paused: true,
                    buffered: false,
                },
            )];
            if let Some(saved) = stream.saved.take() {
                steps.push(backend.set_attribute(h, Attribute::Volume, saved.volume));
                steps.push(backend.set_attribute(h, Attribute::Frequency, saved.frequency));
                steps.push(backend.set_attribute(h, Attribute::NoRamp, saved.no_ramp));
            }
            for e in steps.into_iter().filter_map(Result::err) {
                warn!(error = %e, code = e.code.code(), clip = %entry.clip.id, "Soundtrack export reattach step failed");
            }
            stream.active = false;
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Clips the mixdown can read, in insertion order.
    pub fn export_sources(&self) -> Vec<ExportSource> {
        self.entries
            .iter()
            .filter_map(|e| {
                let stream = e.stream.as_ref()?;
                Some(ExportSource {
                    handle: stream.handle,
                    start: e.clip.start,
                    length: e.clip.length,
                    volume: e.clip.volume,
                    sample_rate: stream.sample_rate,
                    channels: stream.channels,
                })
            })
            .collect()
    }

    /// Free every stream but keep the clips.
    pub fn release_streams(&mut self) {
        let backend = self.topology.backend().clone();
        for entry in &mut self.entries {
            if let Some(stream) = entry.stream.take() {
                if let Err(e) = backend.free_channel(stream.handle) {
                    debug!(error = %e, clip = %entry.clip.id, "Soundtrack stream already released");
                }
            }
        }
        self.detached = false;
    }

    /// Re-open streams for clips that have none.
    pub fn reload_streams(&mut self) {
        for i in 0..self.entries.len() {
            if self.entries[i].stream.is_none() {
                let stream = self.open(&self.entries[i].clip);
                self.entries[i].stream = stream;
            }
        }
    }
}

impl Drop for SoundtrackPlayer {
    fn drop(&mut self) {
        self.release_streams();
    }
}
