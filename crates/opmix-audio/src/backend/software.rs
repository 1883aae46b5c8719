//! In-process software mixing backend.
//!
//! A synchronous mixing graph behind a single mutex. Decode mixers render
//! when pulled (by a parent mixer or `read_data`); realtime mixers render
//! when the device callback calls [`SoftwareBackend::render_output`].
//! Every mixer renders stereo.

use super::{
    Attribute, AudioBackend, BackendError, BackendResult, ChannelFlags, ChannelInfo,
    DecodedSource, ErrorCode, Handle, LatencyProfile, MixerFlags, StreamFlags,
};
use crate::spatial::{Listener3d, Source3d};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Seconds of output kept per buffered channel for levels and peeks.
const HISTORY_SECS: f32 = 1.0;

/// Left/right gain for a balance control.
///
/// Center leaves both sides at unity; moving toward one side attenuates the
/// other linearly.
pub fn balance_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

/// Device behaviour the software backend should pretend to have.
#[derive(Debug, Clone, Default)]
pub struct DeviceSimulation {
    /// Native rate reported for the output device.
    pub device_rate: Option<u32>,
    /// If set, `init` rejects any other rate.
    pub accepted_rates: Option<Vec<u32>>,
    /// If set, `init` rejects any other profile.
    pub accepted_profiles: Option<Vec<LatencyProfile>>,
    /// `init` always fails with `NoDevice`.
    pub no_device: bool,
}

struct InitState {
    sample_rate: u32,
    profile: LatencyProfile,
}

/// Rolling stereo output of one channel.
struct History {
    frames: VecDeque<[f32; 2]>,
    capacity: usize,
    sample_rate: u32,
}

impl History {
    fn new(sample_rate: u32) -> Self {
        let capacity = ((sample_rate as f32 * HISTORY_SECS) as usize).max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate,
        }
    }

    fn push(&mut self, interleaved: &[f32]) {
        for frame in interleaved.chunks_exact(2) {
            if self.frames.len() == self.capacity {
                self.frames.pop_front();
            }
            self.frames.push_back([frame[0], frame[1]]);
        }
    }

    fn push_silence(&mut self, frames: usize) {
        for _ in 0..frames.min(self.capacity) {
            if self.frames.len() == self.capacity {
                self.frames.pop_front();
            }
            self.frames.push_back([0.0, 0.0]);
        }
    }

    fn rms(&self, window_secs: f32) -> (f32, f32) {
        let window = ((window_secs * self.sample_rate as f32).round() as usize).max(1);
        let n = window.min(self.frames.len());
        if n == 0 {
            return (0.0, 0.0);
        }
        let (mut l, mut r) = (0.0f64, 0.0f64);
        for frame in self.frames.iter().skip(self.frames.len() - n) {
            l += (frame[0] as f64).powi(2);
            r += (frame[1] as f64).powi(2);
        }
        (
            (l / n as f64).sqrt() as f32,
            (r / n as f64).sqrt() as f32,
        )
    }

    fn copy_recent(&self, out: &mut [f32]) -> usize {
        let frames = out.len() / 2;
        let available = frames.min(self.frames.len());
        let pad = frames - available;
        out[..pad * 2].fill(0.0);
        for (i, frame) in self
            .frames
            .iter()
            .skip(self.frames.len() - available)
            .enumerate()
        {
            out[(pad + i) * 2] = frame[0];
            out[(pad + i) * 2 + 1] = frame[1];
        }
        frames * 2
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

struct StreamNode {
    source: DecodedSource,
    /// Fractional read position in source frames.
    position: f64,
    source_3d: Option<Source3d>,
}

struct MixerNode {
    sample_rate: u32,
    decode: bool,
    playing: bool,
    sources: Vec<Handle>,
    rendered: u64,
}

enum NodeKind {
    Stream(StreamNode),
    Mixer(MixerNode),
}

struct Node {
    kind: NodeKind,
    parent: Option<Handle>,
    paused_in_mixer: bool,
    volume: f32,
    pan: f32,
    frequency: f32,
    no_ramp: bool,
    history: Option<History>,
}

impl Node {
    fn is_decode(&self) -> bool {
        match &self.kind {
            NodeKind::Stream(_) => true,
            NodeKind::Mixer(m) => m.decode,
        }
    }
}

#[derive(Default)]
struct MixerState {
    init: Option<InitState>,
    device: DeviceSimulation,
    nodes: HashMap<Handle, Node>,
    listener: Listener3d,
    applied_3d: u64,
    next_handle: u64,
}

impl MixerState {
    fn allocate(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::from_raw(self.next_handle)
    }

    fn node(&self, op: &'static str, handle: Handle) -> BackendResult<&Node> {
        self.nodes
            .get(&handle)
            .ok_or(BackendError::new(op, ErrorCode::InvalidHandle))
    }

    fn node_mut(&mut self, op: &'static str, handle: Handle) -> BackendResult<&mut Node> {
        self.nodes
            .get_mut(&handle)
            .ok_or(BackendError::new(op, ErrorCode::InvalidHandle))
    }

    fn is_ancestor(&self, candidate: Handle, of: Handle) -> bool {
        let mut cursor = Some(of);
        while let Some(h) = cursor {
            if h == candidate {
                return true;
            }
            cursor = self.nodes.get(&h).and_then(|n| n.parent);
        }
        false
    }

    /// Render `frames` stereo frames of a stream at `out_rate` into `out`.
    fn render_stream(&mut self, handle: Handle, frames: usize, out_rate: u32, out: &mut [f32]) {
        let out = &mut out[..frames * 2];
        let Some(node) = self.nodes.get_mut(&handle) else {
            out.fill(0.0);
            return;
        };
        let (gain_l, gain_r) = balance_gains(node.pan);
        let volume = node.volume;
        let step = node.frequency as f64 / out_rate.max(1) as f64;
        let NodeKind::Stream(stream) = &mut node.kind else {
            out.fill(0.0);
            return;
        };

        let source = &stream.source;
        let channels = source.channels() as usize;
        let length = source.frames() as f64;
        for frame in out.chunks_exact_mut(2) {
            if stream.position >= length {
                frame.fill(0.0);
                continue;
            }
            let index = stream.position.floor() as u64;
            let frac = (stream.position - index as f64) as f32;
            for (c, slot) in frame.iter_mut().enumerate() {
                let ch = c.min(channels - 1);
                let a = source.sample(index, ch);
                let b = if index + 1 < source.frames() {
                    source.sample(index + 1, ch)
                } else {
                    a
                };
                *slot = a + (b - a) * frac;
            }
            frame[0] *= volume * gain_l;
            frame[1] *= volume * gain_r;
            stream.position = (stream.position + step).min(length);
        }

        if let Some(history) = node.history.as_mut() {
            history.push(out);
        }
    }

    /// Render a mixer and everything plugged into it.
    fn render_mixer(&mut self, handle: Handle, frames: usize, out: &mut [f32]) -> BackendResult<()> {
        let out = &mut out[..frames * 2];
        out.fill(0.0);
        let node = self.node("render", handle)?;
        let volume = node.volume;
        let NodeKind::Mixer(mixer) = &node.kind else {
            return Err(BackendError::new("render", ErrorCode::NotAvailable));
        };
        let rate = mixer.sample_rate;
        let sources = mixer.sources.clone();

        let mut scratch = vec![0.0f32; frames * 2];
        for child in sources {
            let Some(child_node) = self.nodes.get_mut(&child) else {
                continue;
            };
            if child_node.paused_in_mixer {
                if let Some(history) = child_node.history.as_mut() {
                    history.push_silence(frames);
                }
                continue;
            }
            if matches!(child_node.kind, NodeKind::Mixer(_)) {
                self.render_mixer(child, frames, &mut scratch)?;
            } else {
                self.render_stream(child, frames, rate, &mut scratch);
            }
            for (o, s) in out.iter_mut().zip(&scratch) {
                if s.is_finite() {
                    *o += *s;
                }
            }
        }

        for s in out.iter_mut() {
            *s *= volume;
        }
        if let Some(node) = self.nodes.get_mut(&handle) {
            if let Some(history) = node.history.as_mut() {
                history.push(out);
            }
            if let NodeKind::Mixer(mixer) = &mut node.kind {
                mixer.rendered += frames as u64;
            }
        }
        Ok(())
    }
}

/// Software implementation of [`AudioBackend`].
pub struct SoftwareBackend {
    state: Mutex<MixerState>,
    sources: RwLock<HashMap<PathBuf, DecodedSource>>,
}

impl SoftwareBackend {
    /// Headless backend with no output device.
    pub fn new() -> Self {
        Self::with_device(DeviceSimulation::default())
    }

    /// Backend that behaves like the described device.
    pub fn with_device(device: DeviceSimulation) -> Self {
        Self {
            state: Mutex::new(MixerState {
                device,
                ..Default::default()
            }),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Report a native device rate (e.g. queried from cpal).
    pub fn set_device_rate(&self, rate: Option<u32>) {
        self.state.lock().device.device_rate = rate;
    }

    /// Pretend another component already initialized the backend.
    pub fn simulate_external_init(&self, sample_rate: u32) {
        self.state.lock().init = Some(InitState {
            sample_rate,
            profile: LatencyProfile::Default,
        });
    }

    /// Make `path` resolve to an in-memory source instead of a file.
    pub fn register_source(&self, path: impl Into<PathBuf>, source: DecodedSource) {
        self.sources.write().insert(path.into(), source);
    }

    /// Profile used by the last successful `init`.
    pub fn active_profile(&self) -> Option<LatencyProfile> {
        self.state.lock().init.as_ref().map(|i| i.profile)
    }

    /// Stored 3D parameters of a stream.
    pub fn source_3d(&self, handle: Handle) -> Option<Source3d> {
        match self.state.lock().nodes.get(&handle).map(|n| &n.kind) {
            Some(NodeKind::Stream(s)) => s.source_3d,
            _ => None,
        }
    }

    pub fn listener_3d(&self) -> Listener3d {
        self.state.lock().listener
    }

    /// Number of `apply_3d` calls so far.
    pub fn applied_3d_count(&self) -> u64 {
        self.state.lock().applied_3d
    }

    /// Number of live handles (streams and mixers).
    pub fn handle_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Render the realtime output into an interleaved device buffer.
    ///
    /// Every playing realtime mixer without a parent is summed. Stereo is
    /// mapped onto `channels` device channels by duplicating the right
    /// channel into extras, or averaging for mono devices.
    pub fn render_output(&self, out: &mut [f32], channels: usize) {
        out.fill(0.0);
        let channels = channels.max(1);
        let frames = out.len() / channels;
        if frames == 0 {
            return;
        }
        let mut state = self.state.lock();
        let roots: Vec<Handle> = state
            .nodes
            .iter()
            .filter_map(|(h, n)| match &n.kind {
                NodeKind::Mixer(m) if !m.decode && m.playing && n.parent.is_none() => Some(*h),
                _ => None,
            })
            .collect();

        let mut stereo = vec![0.0f32; frames * 2];
        let mut sum = vec![0.0f32; frames * 2];
        for root in roots {
            if state.render_mixer(root, frames, &mut stereo).is_ok() {
                for (o, s) in sum.iter_mut().zip(&stereo) {
                    *o += *s;
                }
            }
        }

        for (frame, pair) in out.chunks_exact_mut(channels).zip(sum.chunks_exact(2)) {
            if channels == 1 {
                frame[0] = (pair[0] + pair[1]) * 0.5;
            } else {
                for (c, slot) in frame.iter_mut().enumerate() {
                    *slot = pair[c.min(1)];
                }
            }
        }
    }

    fn load_source(&self, path: &Path) -> BackendResult<DecodedSource> {
        if let Some(source) = self.sources.read().get(path) {
            return Ok(source.clone());
        }
        DecodedSource::load_wav(path)
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for SoftwareBackend {
    fn output_device_rate(&self) -> Option<u32> {
        self.state.lock().device.device_rate
    }

    fn initialized_rate(&self) -> Option<u32> {
        self.state.lock().init.as_ref().map(|i| i.sample_rate)
    }

    fn init(&self, sample_rate: u32, profile: LatencyProfile) -> BackendResult<()> {
        const OP: &str = "init";
        let mut state = self.state.lock();
        if state.init.is_some() {
            return Err(BackendError::new(OP, ErrorCode::AlreadyInitialized));
        }
        if state.device.no_device {
            return Err(BackendError::new(OP, ErrorCode::NoDevice));
        }
        if sample_rate == 0 {
            return Err(BackendError::new(OP, ErrorCode::UnsupportedFormat));
        }
        if let Some(rates) = &state.device.accepted_rates {
            if !rates.contains(&sample_rate) {
                return Err(BackendError::new(OP, ErrorCode::UnsupportedFormat));
            }
        }
        if let Some(profiles) = &state.device.accepted_profiles {
            if !profiles.contains(&profile) {
                return Err(BackendError::new(OP, ErrorCode::NotAvailable));
            }
        }
        state.init = Some(InitState {
            sample_rate,
            profile,
        });
        Ok(())
    }

    fn free(&self) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.init = None;
    }

    fn create_mixer(
        &self,
        sample_rate: u32,
        channels: u16,
        flags: MixerFlags,
    ) -> BackendResult<Handle> {
        const OP: &str = "create_mixer";
        let mut state = self.state.lock();
        if state.init.is_none() {
            return Err(BackendError::new(OP, ErrorCode::NotInitialized));
        }
        if channels != 2 || sample_rate == 0 {
            return Err(BackendError::new(OP, ErrorCode::UnsupportedFormat));
        }
        let handle = state.allocate();
        state.nodes.insert(
            handle,
            Node {
                kind: NodeKind::Mixer(MixerNode {
                    sample_rate,
                    decode: flags.decode,
                    playing: false,
                    sources: Vec::new(),
                    rendered: 0,
                }),
                parent: None,
                paused_in_mixer: false,
                volume: 1.0,
                pan: 0.0,
                frequency: sample_rate as f32,
                no_ramp: false,
                history: Some(History::new(sample_rate)),
            },
        );
        Ok(handle)
    }

    fn mixer_add_channel(
        &self,
        mixer: Handle,
        channel: Handle,
        flags: ChannelFlags,
    ) -> BackendResult<()> {
        const OP: &str = "mixer_add_channel";
        let mut state = self.state.lock();
        let rate = match &state.node(OP, mixer)?.kind {
            NodeKind::Mixer(m) => m.sample_rate,
            NodeKind::Stream(_) => return Err(BackendError::new(OP, ErrorCode::InvalidHandle)),
        };
        let child = state.node(OP, channel)?;
        if child.parent.is_some() {
            return Err(BackendError::new(OP, ErrorCode::AlreadyInitialized));
        }
        if !child.is_decode() || state.is_ancestor(channel, mixer) {
            return Err(BackendError::new(OP, ErrorCode::NotAvailable));
        }

        let child = state.node_mut(OP, channel)?;
        child.parent = Some(mixer);
        child.paused_in_mixer = flags.paused;
        if matches!(child.kind, NodeKind::Stream(_)) {
            child.history = flags.buffered.then(|| History::new(rate));
        }
        if let Some(NodeKind::Mixer(m)) = state.nodes.get_mut(&mixer).map(|n| &mut n.kind) {
            m.sources.push(channel);
        }
        Ok(())
    }

    fn mixer_remove_channel(&self, channel: Handle) -> BackendResult<()> {
        const OP: &str = "mixer_remove_channel";
        let mut state = self.state.lock();
        let node = state.node_mut(OP, channel)?;
        let Some(parent) = node.parent.take() else {
            return Err(BackendError::new(OP, ErrorCode::NotAvailable));
        };
        node.paused_in_mixer = false;
        if matches!(node.kind, NodeKind::Stream(_)) {
            node.history = None;
        }
        if let Some(NodeKind::Mixer(m)) = state.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            m.sources.retain(|h| *h != channel);
        }
        Ok(())
    }

    fn create_file_stream(&self, path: &Path, flags: StreamFlags) -> BackendResult<Handle> {
        const OP: &str = "create_file_stream";
        if !flags.decode {
            return Err(BackendError::new(OP, ErrorCode::NotAvailable));
        }
        let mut source = self
            .load_source(path)
            .map_err(|e| BackendError::new(OP, e.code))?;
        if flags.mono {
            source = source.to_mono();
        }
        let frequency = source.sample_rate() as f32;

        let mut state = self.state.lock();
        let handle = state.allocate();
        state.nodes.insert(
            handle,
            Node {
                kind: NodeKind::Stream(StreamNode {
                    source,
                    position: 0.0,
                    source_3d: None,
                }),
                parent: None,
                paused_in_mixer: false,
                volume: 1.0,
                pan: 0.0,
                frequency,
                no_ramp: false,
                history: None,
            },
        );
        Ok(handle)
    }

    fn free_channel(&self, handle: Handle) -> BackendResult<()> {
        const OP: &str = "free_channel";
        let mut state = self.state.lock();
        let node = state
            .nodes
            .remove(&handle)
            .ok_or(BackendError::new(OP, ErrorCode::InvalidHandle))?;
        if let Some(parent) = node.parent {
            if let Some(NodeKind::Mixer(m)) = state.nodes.get_mut(&parent).map(|n| &mut n.kind) {
                m.sources.retain(|h| *h != handle);
            }
        }
        if let NodeKind::Mixer(m) = node.kind {
            for source in m.sources {
                if let Some(child) = state.nodes.get_mut(&source) {
                    child.parent = None;
                    child.paused_in_mixer = false;
                }
            }
        }
        Ok(())
    }

    fn play(&self, handle: Handle) -> BackendResult<()> {
        const OP: &str = "play";
        let mut state = self.state.lock();
        match &mut state.node_mut(OP, handle)?.kind {
            NodeKind::Mixer(m) if !m.decode => {
                m.playing = true;
                Ok(())
            }
            _ => Err(BackendError::new(OP, ErrorCode::NotAvailable)),
        }
    }

    fn pause(&self, handle: Handle) -> BackendResult<()> {
        const OP: &str = "pause";
        let mut state = self.state.lock();
        match &mut state.node_mut(OP, handle)?.kind {
            NodeKind::Mixer(m) if !m.decode => {
                m.playing = false;
                Ok(())
            }
            _ => Err(BackendError::new(OP, ErrorCode::NotAvailable)),
        }
    }

    fn is_active(&self, handle: Handle) -> bool {
        matches!(
            self.state.lock().nodes.get(&handle).map(|n| &n.kind),
            Some(NodeKind::Mixer(m)) if !m.decode && m.playing
        )
    }

    fn channel_pause(&self, channel: Handle) -> BackendResult<()> {
        const OP: &str = "channel_pause";
        let mut state = self.state.lock();
        let node = state.node_mut(OP, channel)?;
        if node.parent.is_none() {
            return Err(BackendError::new(OP, ErrorCode::NotAvailable));
        }
        node.paused_in_mixer = true;
        Ok(())
    }

    fn channel_unpause(&self, channel: Handle) -> BackendResult<()> {
        const OP: &str = "channel_unpause";
        let mut state = self.state.lock();
        let node = state.node_mut(OP, channel)?;
        if node.parent.is_none() {
            return Err(BackendError::new(OP, ErrorCode::NotAvailable));
        }
        node.paused_in_mixer = false;
        Ok(())
    }

    fn is_channel_paused(&self, channel: Handle) -> bool {
        self.state
            .lock()
            .nodes
            .get(&channel)
            .is_some_and(|n| n.parent.is_some() && n.paused_in_mixer)
    }

    fn set_attribute(&self, handle: Handle, attribute: Attribute, value: f32) -> BackendResult<()> {
        const OP: &str = "set_attribute";
        if !value.is_finite() {
            return Err(BackendError::new(OP, ErrorCode::Unknown(-1)));
        }
        let mut state = self.state.lock();
        let node = state.node_mut(OP, handle)?;
        match attribute {
            Attribute::Volume => node.volume = value.max(0.0),
            Attribute::Pan => node.pan = value.clamp(-1.0, 1.0),
            Attribute::Frequency => {
                if value <= 0.0 {
                    return Err(BackendError::new(OP, ErrorCode::Unknown(-1)));
                }
                node.frequency = value;
            }
            Attribute::NoRamp => node.no_ramp = value != 0.0,
        }
        Ok(())
    }

    fn attribute(&self, handle: Handle, attribute: Attribute) -> BackendResult<f32> {
        let state = self.state.lock();
        let node = state.node("attribute", handle)?;
        Ok(match attribute {
            Attribute::Volume => node.volume,
            Attribute::Pan => node.pan,
            Attribute::Frequency => node.frequency,
            Attribute::NoRamp => f32::from(u8::from(node.no_ramp)),
        })
    }

    fn set_position(&self, handle: Handle, frame: u64, reset_mixer: bool) -> BackendResult<()> {
        const OP: &str = "set_position";
        let mut state = self.state.lock();
        let node = state.node_mut(OP, handle)?;
        match &mut node.kind {
            NodeKind::Stream(s) => {
                s.position = frame.min(s.source.frames()) as f64;
            }
            NodeKind::Mixer(m) => {
                if !m.decode {
                    return Err(BackendError::new(OP, ErrorCode::NotAvailable));
                }
                m.rendered = frame;
            }
        }
        if reset_mixer {
            if let Some(history) = node.history.as_mut() {
                history.clear();
            }
        }
        Ok(())
    }

    fn position(&self, handle: Handle) -> BackendResult<u64> {
        let state = self.state.lock();
        Ok(match &state.node("position", handle)?.kind {
            NodeKind::Stream(s) => s.position.floor() as u64,
            NodeKind::Mixer(m) => m.rendered,
        })
    }

    fn length(&self, handle: Handle) -> BackendResult<u64> {
        const OP: &str = "length";
        let state = self.state.lock();
        match &state.node(OP, handle)?.kind {
            NodeKind::Stream(s) => Ok(s.source.frames()),
            NodeKind::Mixer(_) => Err(BackendError::new(OP, ErrorCode::NotAvailable)),
        }
    }

    fn channel_info(&self, handle: Handle) -> BackendResult<ChannelInfo> {
        let state = self.state.lock();
        Ok(match &state.node("channel_info", handle)?.kind {
            NodeKind::Stream(s) => ChannelInfo {
                sample_rate: s.source.sample_rate(),
                channels: s.source.channels(),
            },
            NodeKind::Mixer(m) => ChannelInfo {
                sample_rate: m.sample_rate,
                channels: 2,
            },
        })
    }

    fn level(&self, handle: Handle, window_secs: f32) -> BackendResult<(f32, f32)> {
        const OP: &str = "level";
        let state = self.state.lock();
        state
            .node(OP, handle)?
            .history
            .as_ref()
            .map(|h| h.rms(window_secs))
            .ok_or(BackendError::new(OP, ErrorCode::NotAvailable))
    }

    fn read_data(&self, handle: Handle, out: &mut [f32]) -> BackendResult<usize> {
        const OP: &str = "read_data";
        let mut state = self.state.lock();
        let node = state.node_mut(OP, handle)?;
        match &mut node.kind {
            NodeKind::Stream(s) => {
                let channels = s.source.channels() as usize;
                let start = s.position.floor() as u64;
                let available = s.source.frames().saturating_sub(start) as usize;
                let frames = (out.len() / channels).min(available);
                let begin = start as usize * channels;
                out[..frames * channels]
                    .copy_from_slice(&s.source.samples()[begin..begin + frames * channels]);
                s.position = (start + frames as u64) as f64;
                Ok(frames * channels)
            }
            NodeKind::Mixer(m) => {
                if !m.decode {
                    return Err(BackendError::new(OP, ErrorCode::NotAvailable));
                }
                let frames = out.len() / 2;
                state.render_mixer(handle, frames, out)?;
                Ok(frames * 2)
            }
        }
    }

    fn peek_data(&self, handle: Handle, out: &mut [f32]) -> BackendResult<usize> {
        const OP: &str = "peek_data";
        let state = self.state.lock();
        state
            .node(OP, handle)?
            .history
            .as_ref()
            .map(|h| h.copy_recent(out))
            .ok_or(BackendError::new(OP, ErrorCode::NotAvailable))
    }

    fn update(&self, mixer: Handle) -> BackendResult<()> {
        const OP: &str = "update";
        let state = self.state.lock();
        match state.node(OP, mixer)?.kind {
            NodeKind::Mixer(_) => Ok(()),
            NodeKind::Stream(_) => Err(BackendError::new(OP, ErrorCode::InvalidHandle)),
        }
    }

    fn set_source_3d(&self, handle: Handle, source: &Source3d) -> BackendResult<()> {
        const OP: &str = "set_source_3d";
        let mut state = self.state.lock();
        match &mut state.node_mut(OP, handle)?.kind {
            NodeKind::Stream(s) => {
                s.source_3d = Some(*source);
                Ok(())
            }
            NodeKind::Mixer(_) => Err(BackendError::new(OP, ErrorCode::NotAvailable)),
        }
    }

    fn set_listener_3d(&self, listener: &Listener3d) -> BackendResult<()> {
        self.state.lock().listener = *listener;
        Ok(())
    }

    fn apply_3d(&self) {
        self.state.lock().applied_3d += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_source(frames: usize, channels: u16, rate: u32) -> DecodedSource {
        let samples = (0..frames * channels as usize)
            .map(|i| (i / channels as usize) as f32 / frames as f32)
            .collect();
        DecodedSource::from_interleaved(samples, rate, channels)
    }

    fn initialized() -> SoftwareBackend {
        let backend = SoftwareBackend::new();
        backend.init(48000, LatencyProfile::LowLatency).unwrap();
        backend
    }

    #[test]
    fn test_balance_gains() {
        assert_eq!(balance_gains(0.0), (1.0, 1.0));
        assert_eq!(balance_gains(-1.0), (1.0, 0.0));
        assert_eq!(balance_gains(1.0), (0.0, 1.0));
        let (l, r) = balance_gains(0.5);
        assert!((l - 0.5).abs() < 1e-6 && r == 1.0);
    }

    #[test]
    fn test_init_twice_fails() {
        let backend = initialized();
        let err = backend.init(48000, LatencyProfile::Default).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyInitialized);
    }

    #[test]
    fn test_accepted_rates_enforced() {
        let backend = SoftwareBackend::with_device(DeviceSimulation {
            accepted_rates: Some(vec![44100]),
            ..Default::default()
        });
        assert!(backend.init(48000, LatencyProfile::LowLatency).is_err());
        assert!(backend.init(44100, LatencyProfile::LowLatency).is_ok());
        assert_eq!(backend.initialized_rate(), Some(44100));
    }

    #[test]
    fn test_read_stream_native_and_advance() {
        let backend = initialized();
        backend.register_source("a.wav", ramp_source(100, 2, 44100));
        let h = backend
            .create_file_stream(Path::new("a.wav"), StreamFlags { decode: true, float: true, mono: false })
            .unwrap();
        let mut buf = vec![0.0; 20];
        assert_eq!(backend.read_data(h, &mut buf).unwrap(), 20);
        assert_eq!(backend.position(h).unwrap(), 10);
        backend.set_position(h, 95, true).unwrap();
        assert_eq!(backend.read_data(h, &mut buf).unwrap(), 10);
    }

    #[test]
    fn test_paused_source_is_silent_in_mixer() {
        let backend = initialized();
        backend.register_source("one.wav", DecodedSource::from_interleaved(vec![0.5; 480], 48000, 1));
        let bus = backend
            .create_mixer(48000, 2, MixerFlags { decode: true, nonstop: true })
            .unwrap();
        let s = backend
            .create_file_stream(Path::new("one.wav"), StreamFlags { decode: true, float: true, mono: false })
            .unwrap();
        backend
            .mixer_add_channel(bus, s, ChannelFlags { paused: true, buffered: true })
            .unwrap();

        let mut out = vec![1.0; 64];
        backend.read_data(bus, &mut out).unwrap();
        assert!(out.iter().all(|v| *v == 0.0));

        backend.channel_unpause(s).unwrap();
        backend.read_data(bus, &mut out).unwrap();
        assert!(out.iter().all(|v| (*v - 0.5).abs() < 1e-6));
        let (l, r) = backend.level(s, 0.0005).unwrap();
        assert!(l > 0.4 && r > 0.4);
    }

    #[test]
    fn test_frequency_doubles_read_speed() {
        let backend = initialized();
        backend.register_source("r.wav", ramp_source(1000, 1, 48000));
        let bus = backend
            .create_mixer(48000, 2, MixerFlags { decode: true, nonstop: true })
            .unwrap();
        let s = backend
            .create_file_stream(Path::new("r.wav"), StreamFlags { decode: true, float: true, mono: false })
            .unwrap();
        backend.mixer_add_channel(bus, s, ChannelFlags::default()).unwrap();
        backend.set_attribute(s, Attribute::Frequency, 96000.0).unwrap();
        let mut out = vec![0.0; 200];
        backend.read_data(bus, &mut out).unwrap();
        assert_eq!(backend.position(s).unwrap(), 200);
    }

    #[test]
    fn test_render_output_requires_playing_root() {
        let backend = initialized();
        backend.register_source("c.wav", DecodedSource::from_interleaved(vec![0.25; 4800], 48000, 1));
        let global = backend.create_mixer(48000, 2, MixerFlags { decode: false, nonstop: true }).unwrap();
        let bus = backend.create_mixer(48000, 2, MixerFlags { decode: true, nonstop: true }).unwrap();
        let s = backend
            .create_file_stream(Path::new("c.wav"), StreamFlags { decode: true, float: true, mono: false })
            .unwrap();
        backend.mixer_add_channel(global, bus, ChannelFlags { paused: false, buffered: true }).unwrap();
        backend.mixer_add_channel(bus, s, ChannelFlags::default()).unwrap();

        let mut out = vec![0.0; 64];
        backend.render_output(&mut out, 2);
        assert!(out.iter().all(|v| *v == 0.0));

        backend.play(global).unwrap();
        backend.render_output(&mut out, 2);
        assert!(out.iter().all(|v| (*v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_mixer_cycle_rejected() {
        let backend = initialized();
        let a = backend.create_mixer(48000, 2, MixerFlags { decode: true, nonstop: false }).unwrap();
        let b = backend.create_mixer(48000, 2, MixerFlags { decode: true, nonstop: false }).unwrap();
        backend.mixer_add_channel(a, b, ChannelFlags::default()).unwrap();
        let err = backend.mixer_add_channel(b, a, ChannelFlags::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAvailable);
    }

    #[test]
    fn test_free_clears_everything() {
        let backend = initialized();
        backend.create_mixer(48000, 2, MixerFlags::default()).unwrap();
        assert_eq!(backend.handle_count(), 1);
        backend.free();
        assert_eq!(backend.handle_count(), 0);
        assert_eq!(backend.initialized_rate(), None);
    }
}
