//! One decoded file routed into the Operator bus.
//!
//! An `OperatorStream` owns its backend handle and releases it on drop.
//! Backend call failures are logged with the backend error code and the
//! call becomes a no-op; only `load` reports failure to the caller.

use crate::backend::{Attribute, AudioBackend, BackendResult, ChannelFlags, Handle, StreamFlags};
use crate::config::AudioConfig;
use crate::resample::{pull_resampled, Layout};
use crate::spatial::SpatialParams;
use opmix_core::{OpMixError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MIN_SPEED: f32 = 0.1;
pub const MAX_SPEED: f32 = 4.0;

/// Variant payload of a stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamKind {
    /// Planar stereo with a balance control.
    Stereo { pan: f32 },
    /// Mono source positioned in 3D by the backend.
    Spatial(SpatialParams),
}

impl StreamKind {
    pub fn is_spatial(&self) -> bool {
        matches!(self, StreamKind::Spatial(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Tunables shared by every stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSettings {
    /// Changes at or below this are not sent to the backend.
    pub epsilon: f32,
    pub max_duration_secs: f64,
    pub level_window_secs: f32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&AudioConfig::default())
    }
}

impl From<&AudioConfig> for StreamSettings {
    fn from(config: &AudioConfig) -> Self {
        Self {
            epsilon: config.parameter_epsilon,
            max_duration_secs: config.max_stream_duration_secs,
            level_window_secs: config.level_window_secs,
        }
    }
}

pub struct OperatorStream {
    backend: Arc<dyn AudioBackend>,
    handle: Handle,
    bus: Handle,
    path: PathBuf,
    kind: StreamKind,
    transport: TransportState,
    stale_muted: bool,
    user_muted: bool,
    volume: f32,
    speed: f32,
    seek_normalized: f32,
    native_channels: u16,
    native_frequency: u32,
    length_frames: u64,
    export_level: Option<f32>,
    settings: StreamSettings,
}

impl OperatorStream {
    /// Open `path` as a float decode stream and add it to `bus`, paused and
    /// silent. Spatial streams are decoded to mono.
    pub fn load(
        backend: Arc<dyn AudioBackend>,
        path: &Path,
        bus: Handle,
        kind: StreamKind,
        settings: StreamSettings,
    ) -> Result<Self> {
        let flags = StreamFlags {
            decode: true,
            float: true,
            mono: kind.is_spatial(),
        };
        let kind = match kind {
            StreamKind::Stereo { pan } if pan.is_finite() => StreamKind::Stereo {
                pan: pan.clamp(-1.0, 1.0),
            },
            StreamKind::Stereo { .. } => StreamKind::Stereo { pan: 0.0 },
            StreamKind::Spatial(params) => StreamKind::Spatial(params.sanitized()),
        };
        let handle = backend.create_file_stream(path, flags)?;

        // From here on `stream` owns the handle; early returns free it.
        let mut stream = Self {
            backend,
            handle,
            bus,
            path: path.to_path_buf(),
            kind,
            transport: TransportState::Stopped,
            stale_muted: false,
            user_muted: false,
            volume: 1.0,
            speed: 1.0,
            seek_normalized: 0.0,
            native_channels: 0,
            native_frequency: 0,
            length_frames: 0,
            export_level: None,
            settings,
        };

        let info = stream.backend.channel_info(handle)?;
        stream.native_channels = info.channels;
        stream.native_frequency = info.sample_rate;
        stream.length_frames = stream.backend.length(handle)?;

        let duration = stream.duration_secs();
        if !(duration > 0.0 && duration <= settings.max_duration_secs) {
            return Err(OpMixError::InvalidParameter(format!(
                "{}: implausible duration {duration:.3}s",
                path.display()
            )));
        }

        stream.backend.mixer_add_channel(
            bus,
            handle,
            ChannelFlags {
                paused: true,
                buffered: true,
            },
        )?;
        stream.backend.set_attribute(handle, Attribute::Volume, 0.0)?;

        match kind {
            StreamKind::Stereo { pan } => {
                stream
                    .backend
                    .set_attribute(handle, Attribute::Pan, pan)?;
            }
            StreamKind::Spatial(params) => stream.push_spatial(&params),
        }

        debug!(
            path = %path.display(),
            handle = %handle,
            channels = info.channels,
            sample_rate = info.sample_rate,
            duration,
            "Loaded operator stream"
        );
        Ok(stream)
    }

    fn check(&self, what: &str, result: BackendResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.code.code(),
                    path = %self.path.display(),
                    "Operator stream {what} failed"
                );
                false
            }
        }
    }

    fn nudge_bus(&self) {
        let result = self.backend.update(self.bus);
        self.check("bus update", result);
    }

    fn apply_output_volume(&self) {
        let result = self
            .backend
            .set_attribute(self.handle, Attribute::Volume, self.effective_volume());
        self.check("volume", result);
    }

    fn rewind(&self) {
        let result = self.backend.set_position(self.handle, 0, true);
        self.check("rewind", result);
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn is_playing(&self) -> bool {
        self.transport == TransportState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.transport == TransportState::Paused
    }

    pub fn is_stale(&self) -> bool {
        self.stale_muted
    }

    pub fn is_user_muted(&self) -> bool {
        self.user_muted
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn seek_normalized_value(&self) -> f32 {
        self.seek_normalized
    }

    pub fn native_channels(&self) -> u16 {
        self.native_channels
    }

    pub fn native_frequency(&self) -> u32 {
        self.native_frequency
    }

    pub fn duration_secs(&self) -> f64 {
        if self.native_frequency == 0 {
            return 0.0;
        }
        self.length_frames as f64 / self.native_frequency as f64
    }

    /// Current read position in seconds.
    pub fn position_secs(&self) -> f64 {
        if self.native_frequency == 0 {
            return 0.0;
        }
        self.backend
            .position(self.handle)
            .map(|frame| frame as f64 / self.native_frequency as f64)
            .unwrap_or(0.0)
    }

    /// `0` when user-muted or stale, otherwise the stored volume.
    pub fn effective_volume(&self) -> f32 {
        if self.user_muted || self.stale_muted {
            0.0
        } else {
            self.volume
        }
    }

    pub fn play(&mut self) {
        self.stale_muted = false;
        let result = self.backend.channel_unpause(self.handle);
        self.check("unpause", result);
        self.transport = TransportState::Playing;
        self.apply_output_volume();
        self.nudge_bus();
    }

    /// Enter `Paused` without producing sound, so a later `resume` starts
    /// playback from the current position.
    pub fn arm_paused(&mut self) {
        self.stale_muted = false;
        if self.transport == TransportState::Playing {
            let result = self.backend.channel_pause(self.handle);
            self.check("pause", result);
        }
        self.transport = TransportState::Paused;
    }

    pub fn pause(&mut self) {
        if self.transport != TransportState::Playing {
            return;
        }
        let result = self.backend.channel_pause(self.handle);
        self.check("pause", result);
        self.transport = TransportState::Paused;
    }

    pub fn resume(&mut self) {
        if self.transport != TransportState::Paused {
            return;
        }
        let result = self.backend.channel_unpause(self.handle);
        self.check("unpause", result);
        self.transport = TransportState::Playing;
        self.apply_output_volume();
        self.nudge_bus();
    }

    /// Pause and rewind to the start. The stream stays loaded.
    pub fn stop(&mut self) {
        let result = self.backend.channel_pause(self.handle);
        self.check("pause", result);
        self.rewind();
        self.transport = TransportState::Stopped;
    }

    /// Mark the stream stale or live again. Returns whether anything changed.
    ///
    /// Live staleness stops and rewinds; during export the position and
    /// transport are kept because the mixdown is reading them.
    pub fn set_stale(&mut self, stale: bool, exporting: bool) -> bool {
        if stale == self.stale_muted {
            return false;
        }
        self.stale_muted = stale;
        if stale {
            let result = self
                .backend
                .set_attribute(self.handle, Attribute::Volume, 0.0);
            self.check("mute", result);
            if !exporting {
                let result = self.backend.channel_pause(self.handle);
                self.check("pause", result);
                self.rewind();
                self.transport = TransportState::Stopped;
            }
        } else if self.transport == TransportState::Playing {
            self.apply_output_volume();
        }
        true
    }

    pub fn set_volume(&mut self, volume: f32, mute: bool) {
        self.volume = if volume.is_finite() { volume.max(0.0) } else { 0.0 };
        self.user_muted = mute;
        if self.transport == TransportState::Playing {
            self.apply_output_volume();
        }
    }

    /// Clamp to `[MIN_SPEED, MAX_SPEED]` and scale the playback frequency by
    /// the ratio to the previous speed.
    pub fn set_speed(&mut self, speed: f32) {
        if !speed.is_finite() {
            return;
        }
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        if (speed - self.speed).abs() <= self.settings.epsilon {
            return;
        }
        let current = self
            .backend
            .attribute(self.handle, Attribute::Frequency)
            .unwrap_or(self.native_frequency as f32 * self.speed);
        let result = self.backend.set_attribute(
            self.handle,
            Attribute::Frequency,
            current * (speed / self.speed),
        );
        if self.check("speed", result) {
            self.speed = speed;
        }
    }

    /// Absolute seek. Any samples the bus buffered from the old position
    /// are discarded.
    pub fn seek(&mut self, seconds: f64) {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let frame = ((seconds * self.native_frequency as f64) as u64).min(self.length_frames);
        let result = self.backend.set_position(self.handle, frame, true);
        self.check("seek", result);
    }

    /// Seek to a fraction of the duration, if it moved beyond epsilon.
    pub fn seek_normalized(&mut self, position: f32) {
        if !position.is_finite() {
            return;
        }
        let position = position.clamp(0.0, 1.0);
        if (position - self.seek_normalized).abs() <= self.settings.epsilon {
            return;
        }
        self.seek_normalized = position;
        self.seek(position as f64 * self.duration_secs());
    }

    /// Stereo balance. Ignored by spatial streams.
    pub fn set_pan(&mut self, pan: f32) {
        let StreamKind::Stereo { pan: current } = &mut self.kind else {
            return;
        };
        if !pan.is_finite() {
            return;
        }
        let pan = pan.clamp(-1.0, 1.0);
        if (pan - *current).abs() <= self.settings.epsilon {
            return;
        }
        *current = pan;
        let result = self.backend.set_attribute(self.handle, Attribute::Pan, pan);
        self.check("pan", result);
    }

    /// 3D placement. Ignored by stereo streams.
    pub fn set_spatial(&mut self, params: SpatialParams) {
        let StreamKind::Spatial(current) = &mut self.kind else {
            return;
        };
        let params = params.sanitized_over(current);
        if !params.differs(current, self.settings.epsilon) {
            return;
        }
        *current = params;
        self.push_spatial(&params);
    }

    fn push_spatial(&self, params: &SpatialParams) {
        let result = self.backend.set_source_3d(self.handle, &params.source);
        self.check("3D source", result);
        let result = self.backend.set_listener_3d(&params.listener);
        self.check("3D listener", result);
        self.backend.apply_3d();
    }

    /// Pull `duration` seconds starting at `start_time` directly from the
    /// stream and convert them to the target layout. Returns samples written.
    pub fn render_audio(
        &mut self,
        start_time: f64,
        duration: f64,
        output: &mut [f32],
        target_rate: u32,
        target_channels: usize,
    ) -> usize {
        if target_rate == 0 || target_channels == 0 || self.native_channels == 0 {
            return 0;
        }
        let out_layout = Layout::new(target_rate, target_channels);
        let in_layout = Layout::new(self.native_frequency, self.native_channels as usize);
        let out_frames = ((duration.max(0.0) * target_rate as f64).round() as usize)
            .min(out_layout.frames(output.len()));
        let output = &mut output[..out_frames * target_channels];

        let start = if start_time.is_finite() { start_time.max(0.0) } else { 0.0 };
        let frame = ((start * self.native_frequency as f64) as u64).min(self.length_frames);
        output.fill(0.0);
        match pull_resampled(
            self.backend.as_ref(),
            self.handle,
            frame,
            in_layout,
            output,
            out_layout,
            1.0,
        ) {
            Ok(frames) => frames * target_channels,
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.code.code(),
                    path = %self.path.display(),
                    "Operator stream read failed"
                );
                output.fill(0.0);
                0
            }
        }
    }

    fn live_level(&self) -> f32 {
        match self
            .backend
            .level(self.handle, self.settings.level_window_secs)
        {
            Ok((l, r)) => l.max(r).clamp(0.0, 1.0),
            Err(_) => 0.0,
        }
    }

    /// Meter reading in `[0, 1]`. An injected export level wins.
    pub fn level(&self) -> f32 {
        if let Some(level) = self.export_level {
            return level;
        }
        match self.transport {
            TransportState::Stopped => 0.0,
            TransportState::Paused if !self.stale_muted => 0.0,
            _ => self.live_level(),
        }
    }

    /// Freeze the current level as the export reading.
    pub fn capture_export_level(&mut self) {
        self.export_level = Some(match self.transport {
            TransportState::Stopped => 0.0,
            _ => self.live_level(),
        });
    }

    pub fn export_level(&self) -> Option<f32> {
        self.export_level
    }

    /// Copy the most recent bus output of this stream (interleaved stereo).
    pub fn recent_output(&self, out: &mut [f32]) -> usize {
        self.backend.peek_data(self.handle, out).unwrap_or(0)
    }

    /// Rewind and force `Stopped` so nothing plays until export logic asks.
    pub fn prepare_for_export(&mut self) {
        let result = self.backend.channel_pause(self.handle);
        self.check("pause", result);
        self.rewind();
        self.transport = TransportState::Stopped;
        self.export_level = None;
    }

    /// Rewind and play again after an export.
    pub fn restart_after_export(&mut self) {
        self.export_level = None;
        self.stale_muted = false;
        self.rewind();
        let result = self.backend.channel_unpause(self.handle);
        self.check("unpause", result);
        self.transport = TransportState::Playing;
        self.apply_output_volume();
        self.nudge_bus();
    }

    /// Leave export mode without restarting playback.
    pub fn clear_export_level(&mut self) {
        self.export_level = None;
    }
}

impl Drop for OperatorStream {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free_channel(self.handle) {
            debug!(error = %e, handle = %self.handle, "Operator stream already released");
        }
    }
}
