//! Mixer topology: the three persistent buses and the backend lifecycle.
//!
//! ```text
//!   operator streams ──► Operator bus (decode) ──┐
//!                                                ├──► Global bus (realtime) ──► device
//! soundtrack streams ──► Soundtrack bus (decode) ┘
//! ```
//!
//! Initialization is lazy, idempotent and sticky on failure: once an attempt
//! has failed every later `initialize` returns `false` without touching the
//! backend until `shutdown` resets the state (e.g. after a device change).

use crate::backend::{
    Attribute, AudioBackend, BackendError, ChannelFlags, Handle, LatencyProfile, MixerFlags,
    StreamFlags,
};
use crate::config::AudioConfig;
use crate::waveform::Waveform;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One of the three persistent buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bus {
    Global,
    Operator,
    Soundtrack,
}

impl Bus {
    pub const ALL: [Bus; 3] = [Bus::Global, Bus::Operator, Bus::Soundtrack];

    fn index(self) -> usize {
        match self {
            Bus::Global => 0,
            Bus::Operator => 1,
            Bus::Soundtrack => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BusHandles {
    global: Handle,
    operator: Handle,
    soundtrack: Handle,
}

impl BusHandles {
    fn get(&self, bus: Bus) -> Handle {
        match bus {
            Bus::Global => self.global,
            Bus::Operator => self.operator,
            Bus::Soundtrack => self.soundtrack,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum InitStatus {
    Uninitialized,
    Ready(BusHandles),
    Failed,
}

/// Externally configured volume and mute of a bus.
#[derive(Debug, Clone, Copy)]
struct BusControl {
    configured_volume: f32,
    muted: bool,
}

impl BusControl {
    fn effective(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.configured_volume
        }
    }
}

struct TopologyState {
    status: InitStatus,
    sample_rate: u32,
    /// False when we adapted to a backend someone else initialized.
    owns_backend: bool,
    controls: [BusControl; 3],
}

/// Owner of the bus handles and the backend device lifecycle.
pub struct MixerTopology {
    backend: Arc<dyn AudioBackend>,
    state: Mutex<TopologyState>,
    offline: Mutex<HashSet<Handle>>,
    fallback_rates: Vec<u32>,
    level_window: f32,
}

impl MixerTopology {
    pub fn new(backend: Arc<dyn AudioBackend>, config: &AudioConfig) -> Self {
        let controls = Bus::ALL.map(|bus| {
            let settings = config.bus(bus);
            BusControl {
                configured_volume: sanitize_volume(settings.volume),
                muted: settings.muted,
            }
        });
        Self {
            backend,
            state: Mutex::new(TopologyState {
                status: InitStatus::Uninitialized,
                sample_rate: 0,
                owns_backend: false,
                controls,
            }),
            offline: Mutex::new(HashSet::new()),
            fallback_rates: config.fallback_sample_rates.clone(),
            level_window: config.level_window_secs,
        }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Bring up the backend and buses. Returns whether the topology is ready.
    pub fn initialize(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            InitStatus::Ready(_) => return true,
            InitStatus::Failed => return false,
            InitStatus::Uninitialized => {}
        }

        let (sample_rate, owns_backend) = match self.backend.initialized_rate() {
            Some(rate) => {
                warn!(
                    sample_rate = rate,
                    "Audio backend already initialized elsewhere, adapting to its rate; latency may be higher"
                );
                (rate, false)
            }
            None => match self.init_backend() {
                Ok(rate) => (rate, true),
                Err(attempts) => {
                    error!(
                        device_rate = ?self.backend.output_device_rate(),
                        attempts = %attempts.join(", "),
                        "Audio initialization failed; audio disabled until device change"
                    );
                    state.status = InitStatus::Failed;
                    return false;
                }
            },
        };

        match self.create_buses(sample_rate, &state.controls) {
            Ok(handles) => {
                info!(
                    sample_rate,
                    global = %handles.global,
                    operator = %handles.operator,
                    soundtrack = %handles.soundtrack,
                    "Audio mixer topology initialized"
                );
                state.status = InitStatus::Ready(handles);
                state.sample_rate = sample_rate;
                state.owns_backend = owns_backend;
                true
            }
            Err(e) => {
                error!(error = %e, code = e.code.code(), sample_rate, "Failed to create mixer buses");
                if owns_backend {
                    self.backend.free();
                }
                state.status = InitStatus::Failed;
                false
            }
        }
    }

    /// Try every rate and latency profile combination, best first.
    fn init_backend(&self) -> std::result::Result<u32, Vec<String>> {
        let mut rates: Vec<u32> = Vec::new();
        for rate in self
            .backend
            .output_device_rate()
            .into_iter()
            .chain(self.fallback_rates.iter().copied())
        {
            if rate > 0 && !rates.contains(&rate) {
                rates.push(rate);
            }
        }

        let mut attempts = Vec::new();
        for &rate in &rates {
            for profile in LatencyProfile::PREFERENCE {
                match self.backend.init(rate, profile) {
                    Ok(()) => {
                        debug!(sample_rate = rate, ?profile, "Audio backend initialized");
                        return Ok(rate);
                    }
                    Err(e) => attempts.push(format!("{rate} Hz/{profile:?}: {}", e.code)),
                }
            }
        }
        Err(attempts)
    }

    fn create_buses(
        &self,
        sample_rate: u32,
        controls: &[BusControl; 3],
    ) -> std::result::Result<BusHandles, BackendError> {
        let backend = &self.backend;
        let global = backend.create_mixer(
            sample_rate,
            2,
            MixerFlags {
                decode: false,
                nonstop: true,
            },
        )?;
        let decode = MixerFlags {
            decode: true,
            nonstop: true,
        };
        let handles = backend.create_mixer(sample_rate, 2, decode).and_then(|operator| {
            match backend.create_mixer(sample_rate, 2, decode) {
                Ok(soundtrack) => Ok(BusHandles {
                    global,
                    operator,
                    soundtrack,
                }),
                Err(e) => {
                    let _ = backend.free_channel(operator);
                    Err(e)
                }
            }
        });
        let handles = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = backend.free_channel(global);
                return Err(e);
            }
        };

        let wire = || -> std::result::Result<(), BackendError> {
            let buffered = ChannelFlags {
                paused: false,
                buffered: true,
            };
            backend.mixer_add_channel(global, handles.operator, buffered)?;
            backend.mixer_add_channel(global, handles.soundtrack, buffered)?;
            for bus in Bus::ALL {
                backend.set_attribute(
                    handles.get(bus),
                    Attribute::Volume,
                    controls[bus.index()].effective(),
                )?;
            }
            backend.play(global)
        };
        if let Err(e) = wire() {
            for bus in Bus::ALL {
                let _ = backend.free_channel(handles.get(bus));
            }
            return Err(e);
        }
        Ok(handles)
    }

    /// Free the buses and (if we own it) the backend. Idempotent; a later
    /// `initialize` starts from scratch.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let InitStatus::Ready(handles) = state.status {
            for bus in Bus::ALL {
                if let Err(e) = self.backend.free_channel(handles.get(bus)) {
                    debug!(error = %e, ?bus, "Bus already released");
                }
            }
            if state.owns_backend {
                self.backend.free();
                self.offline.lock().clear();
            }
            info!("Audio mixer topology shut down");
        }
        state.status = InitStatus::Uninitialized;
        state.owns_backend = false;
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state.lock().status, InitStatus::Ready(_))
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.state.lock().status, InitStatus::Failed)
    }

    /// Rate of the buses, while ready.
    pub fn sample_rate(&self) -> Option<u32> {
        let state = self.state.lock();
        match state.status {
            InitStatus::Ready(_) => Some(state.sample_rate),
            _ => None,
        }
    }

    pub fn bus(&self, bus: Bus) -> Option<Handle> {
        match self.state.lock().status {
            InitStatus::Ready(handles) => Some(handles.get(bus)),
            _ => None,
        }
    }

    pub fn level_window(&self) -> f32 {
        self.level_window
    }

    /// Set the configured volume. Applied immediately unless muted.
    pub fn set_bus_volume(&self, bus: Bus, volume: f32) {
        let mut state = self.state.lock();
        let control = &mut state.controls[bus.index()];
        control.configured_volume = sanitize_volume(volume);
        let effective = control.effective();
        if let InitStatus::Ready(handles) = state.status {
            self.apply_volume(handles.get(bus), bus, effective);
        }
    }

    /// Mute sets the bus to 0; unmute restores the configured volume as it
    /// is now, not as it was when muting.
    pub fn set_bus_mute(&self, bus: Bus, muted: bool) {
        let mut state = self.state.lock();
        let control = &mut state.controls[bus.index()];
        control.muted = muted;
        let effective = control.effective();
        if let InitStatus::Ready(handles) = state.status {
            self.apply_volume(handles.get(bus), bus, effective);
        }
    }

    fn apply_volume(&self, handle: Handle, bus: Bus, volume: f32) {
        if let Err(e) = self.backend.set_attribute(handle, Attribute::Volume, volume) {
            warn!(error = %e, code = e.code.code(), ?bus, "Failed to set bus volume");
        }
    }

    /// Volume the bus is actually playing at (0 when muted).
    pub fn bus_volume(&self, bus: Bus) -> f32 {
        self.state.lock().controls[bus.index()].effective()
    }

    pub fn configured_bus_volume(&self, bus: Bus) -> f32 {
        self.state.lock().controls[bus.index()].configured_volume
    }

    pub fn is_bus_muted(&self, bus: Bus) -> bool {
        self.state.lock().controls[bus.index()].muted
    }

    /// Windowed RMS level of a bus, max of both channels, in `[0, 1]`.
    pub fn bus_level(&self, bus: Bus) -> f32 {
        let Some(handle) = self.bus(bus) else {
            return 0.0;
        };
        match self.backend.level(handle, self.level_window) {
            Ok((l, r)) => l.max(r).clamp(0.0, 1.0),
            Err(e) => {
                debug!(error = %e, ?bus, "Bus level unavailable");
                0.0
            }
        }
    }

    /// Ask a decode bus to pick up source changes now.
    pub fn nudge(&self, bus: Bus) {
        if let Some(handle) = self.bus(bus) {
            if let Err(e) = self.backend.update(handle) {
                debug!(error = %e, ?bus, "Bus update failed");
            }
        }
    }

    pub fn is_global_playing(&self) -> bool {
        self.bus(Bus::Global)
            .is_some_and(|h| self.backend.is_active(h))
    }

    pub fn pause_global(&self) {
        if let Some(handle) = self.bus(Bus::Global) {
            if let Err(e) = self.backend.pause(handle) {
                warn!(error = %e, code = e.code.code(), "Failed to pause global bus");
            }
        }
    }

    pub fn play_global(&self) {
        if let Some(handle) = self.bus(Bus::Global) {
            if let Err(e) = self.backend.play(handle) {
                warn!(error = %e, code = e.code.code(), "Failed to resume global bus");
            }
        }
    }

    /// Open a decode stream attached to no bus, for one-shot analysis.
    pub fn create_offline_stream(&self, path: &Path) -> Option<Handle> {
        let mut offline = self.offline.lock();
        let flags = StreamFlags {
            decode: true,
            float: true,
            mono: true,
        };
        match self.backend.create_file_stream(path, flags) {
            Ok(handle) => {
                offline.insert(handle);
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, code = e.code.code(), path = %path.display(), "Failed to open analysis stream");
                None
            }
        }
    }

    pub fn free_offline_stream(&self, handle: Handle) {
        let mut offline = self.offline.lock();
        if offline.remove(&handle) {
            if let Err(e) = self.backend.free_channel(handle) {
                debug!(error = %e, "Analysis stream already released");
            }
        }
    }

    /// Min/max waveform of a whole file, read through an offline stream.
    pub fn analyze_waveform(&self, path: &Path, samples_per_pixel: usize) -> Option<Waveform> {
        let handle = self.create_offline_stream(path)?;
        let sample_rate = self
            .backend
            .channel_info(handle)
            .map(|info| info.sample_rate)
            .unwrap_or(0);
        let spp = samples_per_pixel.max(1);
        let mut waveform = Waveform::empty(spp, sample_rate);
        let mut block = vec![0.0f32; spp * 256];
        loop {
            match self.backend.read_data(handle, &mut block) {
                Ok(0) => break,
                Ok(n) => waveform.push_block(&block[..n]),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Waveform read failed");
                    break;
                }
            }
        }
        self.free_offline_stream(handle);
        Some(waveform)
    }

    /// Number of offline analysis streams currently open.
    pub fn offline_stream_count(&self) -> usize {
        self.offline.lock().len()
    }
}

fn sanitize_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.max(0.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::DeviceSimulation;
    use crate::backend::{DecodedSource, SoftwareBackend};

    fn topology(backend: SoftwareBackend) -> (Arc<SoftwareBackend>, MixerTopology) {
        let backend = Arc::new(backend);
        let topology = MixerTopology::new(backend.clone(), &AudioConfig::default());
        (backend, topology)
    }

    #[test]
    fn test_initialize_idempotent() {
        let (backend, topology) = topology(SoftwareBackend::new());
        assert!(topology.initialize());
        assert!(topology.initialize());
        assert_eq!(backend.handle_count(), 3);
        assert_eq!(topology.sample_rate(), Some(48000));
        assert!(topology.is_global_playing());
    }

    #[test]
    fn test_device_rate_preferred() {
        let (backend, topology) = topology(SoftwareBackend::with_device(DeviceSimulation {
            device_rate: Some(96000),
            ..Default::default()
        }));
        assert!(topology.initialize());
        assert_eq!(topology.sample_rate(), Some(96000));
        assert_eq!(backend.active_profile(), Some(LatencyProfile::LowLatency));
    }

    #[test]
    fn test_falls_back_across_rates_and_profiles() {
        let (backend, topology) = topology(SoftwareBackend::with_device(DeviceSimulation {
            device_rate: Some(96000),
            accepted_rates: Some(vec![44100]),
            accepted_profiles: Some(vec![LatencyProfile::Default]),
            no_device: false,
        }));
        assert!(topology.initialize());
        assert_eq!(topology.sample_rate(), Some(44100));
        assert_eq!(backend.active_profile(), Some(LatencyProfile::Default));
    }

    #[test]
    fn test_failure_is_sticky_until_shutdown() {
        let (backend, topology) = topology(SoftwareBackend::with_device(DeviceSimulation {
            no_device: true,
            ..Default::default()
        }));
        assert!(!topology.initialize());
        assert!(topology.has_failed());
        assert!(!topology.initialize());
        assert_eq!(topology.bus_level(Bus::Global), 0.0);

        topology.shutdown();
        assert!(!topology.has_failed());
        assert_eq!(backend.handle_count(), 0);
    }

    #[test]
    fn test_adapts_to_external_init() {
        let (backend, topology) = topology(SoftwareBackend::new());
        backend.simulate_external_init(22050);
        assert!(topology.initialize());
        assert_eq!(topology.sample_rate(), Some(22050));
        topology.shutdown();
        // Not ours to free.
        assert_eq!(backend.initialized_rate(), Some(22050));
    }

    #[test]
    fn test_unmute_restores_configured_volume() {
        let (backend, topology) = topology(SoftwareBackend::new());
        topology.initialize();
        let handle = topology.bus(Bus::Soundtrack).unwrap();

        topology.set_bus_volume(Bus::Soundtrack, 0.8);
        topology.set_bus_mute(Bus::Soundtrack, true);
        assert_eq!(backend.attribute(handle, Attribute::Volume).unwrap(), 0.0);

        topology.set_bus_volume(Bus::Soundtrack, 0.3);
        assert_eq!(backend.attribute(handle, Attribute::Volume).unwrap(), 0.0);

        topology.set_bus_mute(Bus::Soundtrack, false);
        assert_eq!(backend.attribute(handle, Attribute::Volume).unwrap(), 0.3);
    }

    #[test]
    fn test_settings_before_init_are_applied() {
        let (backend, topology) = topology(SoftwareBackend::new());
        topology.set_bus_volume(Bus::Operator, 0.5);
        topology.initialize();
        let handle = topology.bus(Bus::Operator).unwrap();
        assert_eq!(backend.attribute(handle, Attribute::Volume).unwrap(), 0.5);
    }

    #[test]
    fn test_offline_stream_and_waveform() {
        let (backend, topology) = topology(SoftwareBackend::new());
        backend.register_source(
            "tone.wav",
            DecodedSource::from_interleaved(vec![0.5, -0.5].repeat(500), 48000, 2),
        );
        let wf = topology.analyze_waveform(Path::new("tone.wav"), 100).unwrap();
        assert_eq!(wf.data.len(), 5);
        assert_eq!(topology.offline_stream_count(), 0);
        assert!(topology.analyze_waveform(Path::new("missing.wav"), 100).is_none());
    }
}
