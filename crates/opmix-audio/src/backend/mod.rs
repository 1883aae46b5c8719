//! Audio backend capability.
//!
//! The engine only orchestrates; decoding, mixing and device output belong
//! to a backend. `AudioBackend` is the narrow seam the engine talks through:
//! create streams and mixers, wire channels into mixers, set attributes,
//! read levels and pull data. Every call is non-blocking.
//!
//! `SoftwareBackend` is the bundled in-process implementation.

pub mod software;
pub mod source;

pub use software::SoftwareBackend;
pub use source::DecodedSource;

use crate::spatial::{Listener3d, Source3d};
use opmix_core::OpMixError;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Opaque handle to a backend stream or mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// Wrap a raw backend handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw backend handle value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device initialization profile, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyProfile {
    /// Smallest buffers the device accepts.
    LowLatency,
    /// Plain stereo output with default buffering.
    BasicStereo,
    /// Whatever the device defaults to.
    Default,
}

impl LatencyProfile {
    /// All profiles, most preferred first.
    pub const PREFERENCE: [LatencyProfile; 3] = [
        LatencyProfile::LowLatency,
        LatencyProfile::BasicStereo,
        LatencyProfile::Default,
    ];
}

/// Flags for creating a mixer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerFlags {
    /// Decode-only: produces samples when pulled, never touches hardware.
    pub decode: bool,
    /// Keep producing (silent) output when no source is active.
    pub nonstop: bool,
}

/// Flags for creating a file stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    pub decode: bool,
    /// Decode to 32-bit float samples.
    pub float: bool,
    /// Downmix to a single channel at decode time.
    pub mono: bool,
}

/// Flags for adding a channel to a mixer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    /// Added in the paused state.
    pub paused: bool,
    /// Keep recent output so levels and data can be read back.
    pub buffered: bool,
}

/// Settable channel attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Linear gain, 0.0 and up.
    Volume,
    /// -1.0 (left) to 1.0 (right).
    Pan,
    /// Playback rate in Hz.
    Frequency,
    /// 1.0 disables attribute ramping for sample-exact reads.
    NoRamp,
}

/// Native format of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Backend error code (the backend's "last error").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    AlreadyInitialized,
    InvalidHandle,
    FileOpen,
    FileFormat,
    NoDevice,
    UnsupportedFormat,
    NotAvailable,
    Unknown(i32),
}

impl ErrorCode {
    /// Numeric code for logs.
    pub fn code(self) -> i32 {
        match self {
            Self::NotInitialized => 8,
            Self::AlreadyInitialized => 14,
            Self::InvalidHandle => 5,
            Self::FileOpen => 2,
            Self::FileFormat => 41,
            Self::NoDevice => 23,
            Self::UnsupportedFormat => 6,
            Self::NotAvailable => 37,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// A failed backend call.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{op} failed: {code}")]
pub struct BackendError {
    /// The backend operation that failed.
    pub op: &'static str,
    pub code: ErrorCode,
}

impl BackendError {
    pub fn new(op: &'static str, code: ErrorCode) -> Self {
        Self { op, code }
    }
}

impl From<BackendError> for OpMixError {
    fn from(e: BackendError) -> Self {
        OpMixError::Backend {
            op: e.op,
            code: e.code.code(),
        }
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Mixing/decoding capability consumed by the engine.
///
/// Positions and lengths are in frames (one sample per channel). Sample
/// data is interleaved f32.
pub trait AudioBackend: Send + Sync {
    /// Native rate of the current output device, if one is present.
    fn output_device_rate(&self) -> Option<u32>;

    /// Rate of the backend if something already initialized it.
    fn initialized_rate(&self) -> Option<u32>;

    /// Initialize output at `sample_rate` with the given profile.
    fn init(&self, sample_rate: u32, profile: LatencyProfile) -> BackendResult<()>;

    /// Release the device and every handle.
    fn free(&self);

    /// Create a stereo or multichannel mixer.
    fn create_mixer(&self, sample_rate: u32, channels: u16, flags: MixerFlags)
        -> BackendResult<Handle>;

    /// Add `channel` (a stream or decode mixer) as a source of `mixer`.
    fn mixer_add_channel(
        &self,
        mixer: Handle,
        channel: Handle,
        flags: ChannelFlags,
    ) -> BackendResult<()>;

    /// Detach `channel` from whatever mixer it is plugged into.
    fn mixer_remove_channel(&self, channel: Handle) -> BackendResult<()>;

    /// Open a decoded stream from a file.
    fn create_file_stream(&self, path: &Path, flags: StreamFlags) -> BackendResult<Handle>;

    /// Free a stream or mixer.
    fn free_channel(&self, handle: Handle) -> BackendResult<()>;

    /// Start a realtime (non-decode) channel.
    fn play(&self, handle: Handle) -> BackendResult<()>;

    /// Pause a realtime (non-decode) channel.
    fn pause(&self, handle: Handle) -> BackendResult<()>;

    /// Whether a realtime channel is currently playing.
    fn is_active(&self, handle: Handle) -> bool;

    /// Pause a mixer source.
    fn channel_pause(&self, channel: Handle) -> BackendResult<()>;

    /// Resume a mixer source.
    fn channel_unpause(&self, channel: Handle) -> BackendResult<()>;

    /// Whether a mixer source is paused.
    fn is_channel_paused(&self, channel: Handle) -> bool;

    fn set_attribute(&self, handle: Handle, attribute: Attribute, value: f32)
        -> BackendResult<()>;

    fn attribute(&self, handle: Handle, attribute: Attribute) -> BackendResult<f32>;

    /// Seek to `frame`. With `reset_mixer`, any samples the owning mixer
    /// buffered from the old position are discarded.
    fn set_position(&self, handle: Handle, frame: u64, reset_mixer: bool) -> BackendResult<()>;

    fn position(&self, handle: Handle) -> BackendResult<u64>;

    /// Length in frames.
    fn length(&self, handle: Handle) -> BackendResult<u64>;

    fn channel_info(&self, handle: Handle) -> BackendResult<ChannelInfo>;

    /// Windowed RMS level (left, right) over the last `window_secs`.
    fn level(&self, handle: Handle, window_secs: f32) -> BackendResult<(f32, f32)>;

    /// Pull decoded data. Streams yield native-format samples; decode
    /// mixers render and yield their mix. Returns samples written.
    fn read_data(&self, handle: Handle, out: &mut [f32]) -> BackendResult<usize>;

    /// Copy the most recent output of a buffered channel without consuming
    /// anything. Returns samples written (interleaved stereo).
    fn peek_data(&self, handle: Handle, out: &mut [f32]) -> BackendResult<usize>;

    /// Ask a mixer to re-evaluate its sources now.
    fn update(&self, mixer: Handle) -> BackendResult<()>;

    fn set_source_3d(&self, handle: Handle, source: &Source3d) -> BackendResult<()>;

    fn set_listener_3d(&self, listener: &Listener3d) -> BackendResult<()>;

    /// Commit pending 3D changes.
    fn apply_3d(&self);
}
