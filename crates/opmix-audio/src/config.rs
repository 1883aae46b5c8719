//! Persisted audio settings.
//!
//! Stored as JSON at `<config_dir>/opmix/audio.json`:
//! ```text
//! {
//!   "global": { "volume": 1.0, "muted": false },
//!   "operator": { ... },
//!   "soundtrack": { ... },
//!   "fallback_sample_rates": [48000, 44100],
//!   ...
//! }
//! ```

use crate::topology::Bus;
use opmix_core::{OpMixError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Volume and mute of one bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub volume: f32,
    pub muted: bool,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }
}

/// Where the export soundtrack comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackSource {
    /// Soundtrack clips are mixed by the engine.
    #[default]
    Engine,
    /// Soundtrack comes from an external input device; the engine mixes
    /// operators only.
    ExternalDevice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub global: BusSettings,
    pub operator: BusSettings,
    pub soundtrack: BusSettings,
    /// Rates tried after the device's native rate.
    pub fallback_sample_rates: Vec<u32>,
    /// Window for RMS level metering, in seconds.
    pub level_window_secs: f32,
    /// Parameter changes smaller than this are not sent to the backend.
    pub parameter_epsilon: f32,
    /// Longest stream accepted by `Load`, in seconds.
    pub max_stream_duration_secs: f64,
    pub playback_source: PlaybackSource,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            global: BusSettings::default(),
            operator: BusSettings::default(),
            soundtrack: BusSettings::default(),
            fallback_sample_rates: vec![48000, 44100],
            level_window_secs: 0.05,
            parameter_epsilon: 1e-3,
            max_stream_duration_secs: 10.0 * 3600.0,
            playback_source: PlaybackSource::Engine,
        }
    }
}

impl AudioConfig {
    /// `<config_dir>/opmix/audio.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("opmix").join("audio.json"))
    }

    pub fn bus(&self, bus: Bus) -> BusSettings {
        match bus {
            Bus::Global => self.global,
            Bus::Operator => self.operator,
            Bus::Soundtrack => self.soundtrack,
        }
    }

    pub fn bus_mut(&mut self, bus: Bus) -> &mut BusSettings {
        match bus {
            Bus::Global => &mut self.global,
            Bus::Operator => &mut self.operator,
            Bus::Soundtrack => &mut self.soundtrack,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            OpMixError::Serialization(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| OpMixError::Serialization(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from the default path, falling back to defaults when missing or
    /// unreadable.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "No audio config, using defaults");
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "Ignoring unreadable audio config");
            Self::default()
        })
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        for (name, bus) in [
            ("global", self.global),
            ("operator", self.operator),
            ("soundtrack", self.soundtrack),
        ] {
            if !bus.volume.is_finite() || bus.volume < 0.0 {
                return Err(OpMixError::Config(format!(
                    "{name} volume must be a non-negative number"
                )));
            }
        }
        if self.fallback_sample_rates.iter().any(|r| *r == 0) {
            return Err(OpMixError::Config("sample rates must be positive".into()));
        }
        if self.level_window_secs.is_nan() || self.level_window_secs <= 0.0 {
            return Err(OpMixError::Config("level window must be positive".into()));
        }
        if self.max_stream_duration_secs.is_nan() || self.max_stream_duration_secs <= 0.0 {
            return Err(OpMixError::Config(
                "maximum stream duration must be positive".into(),
            ));
        }
        Ok(())
    }
}
