//! OpMix Audio - Real-time operator audio engine
//!
//! Lets a live node graph drive many concurrent audio streams through a
//! shared mixing pipeline, and renders the same audio offline, frame by
//! frame, for export.
//!
//! Architecture:
//! - `AudioBackend`: Decoding/mixing capability (`SoftwareBackend` bundled)
//! - `MixerTopology`: Global, Operator and Soundtrack buses plus device lifecycle
//! - `OperatorStream`: One file on the Operator bus with transport and parameters
//! - `OperatorPlayback`: Per-node orchestration, edge triggers and liveness
//! - `SoundtrackPlayer`: Timeline soundtrack clips
//! - `ExportMixdown`: Deterministic per-frame mixdown for export
//! - `AudioAnalysis`: Waveform and spectrum of the produced audio
//! - `AudioEngine`: Top-level owner of all of the above

pub mod analysis;
pub mod backend;
pub mod config;
pub mod device;
pub mod engine;
pub mod liveness;
pub mod mixdown;
pub mod orchestrator;
pub mod resample;
pub mod soundtrack;
pub mod spatial;
pub mod stream;
pub mod topology;
pub mod waveform;

pub use analysis::AudioAnalysis;
pub use backend::{AudioBackend, SoftwareBackend};
pub use config::{AudioConfig, PlaybackSource};
pub use device::{DeviceEvent, DeviceOutput};
pub use engine::AudioEngine;
pub use mixdown::{ExportMixdown, RecordingState};
pub use orchestrator::{OperatorPlayback, PlaybackParams};
pub use soundtrack::{SoundtrackClip, SoundtrackPlayer};
pub use spatial::{Listener3d, Source3d, SpatialMode, SpatialParams};
pub use stream::{OperatorStream, StreamKind, TransportState};
pub use topology::{Bus, MixerTopology};
pub use waveform::{Waveform, WaveformSample};
