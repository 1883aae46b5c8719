//! 3D placement parameters for spatial operator streams.
//!
//! The positional math itself belongs to the backend; these types carry the
//! computed parameters across the seam.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// How a source is positioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpatialMode {
    /// World-space position.
    #[default]
    Normal,
    /// Position relative to the listener.
    Relative,
    /// 3D processing disabled, plain playback.
    Off,
}

/// Per-source 3D parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Source3d {
    pub position: Vec3,
    /// Distance at which attenuation starts.
    pub min_distance: f32,
    /// Distance beyond which the source no longer gets quieter.
    pub max_distance: f32,
    /// Inner cone angle in degrees (full volume).
    pub inner_cone: f32,
    /// Outer cone angle in degrees.
    pub outer_cone: f32,
    /// Volume outside the outer cone (0.0 to 1.0).
    pub outer_volume: f32,
    pub mode: SpatialMode,
}

impl Default for Source3d {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            min_distance: 1.0,
            max_distance: 100.0,
            inner_cone: 360.0,
            outer_cone: 360.0,
            outer_volume: 1.0,
            mode: SpatialMode::Normal,
        }
    }
}

impl Source3d {
    /// Clamp to values the backend accepts.
    pub fn sanitized(self) -> Self {
        self.sanitized_over(&Self::default())
    }

    /// Like [`Source3d::sanitized`], but non-finite fields keep the value
    /// from `previous` instead of reaching the backend.
    pub fn sanitized_over(mut self, previous: &Self) -> Self {
        self.position = finite_or(self.position, previous.position);
        self.min_distance = finite_scalar_or(self.min_distance, previous.min_distance);
        self.max_distance = finite_scalar_or(self.max_distance, previous.max_distance);
        self.inner_cone = finite_scalar_or(self.inner_cone, previous.inner_cone);
        self.outer_cone = finite_scalar_or(self.outer_cone, previous.outer_cone);
        self.outer_volume = finite_scalar_or(self.outer_volume, previous.outer_volume);

        self.min_distance = self.min_distance.max(0.0);
        self.max_distance = self.max_distance.max(self.min_distance);
        self.inner_cone = self.inner_cone.clamp(0.0, 360.0);
        self.outer_cone = self.outer_cone.clamp(self.inner_cone, 360.0);
        self.outer_volume = self.outer_volume.clamp(0.0, 1.0);
        self
    }

    /// True if any field differs from `other` by more than `epsilon`.
    pub fn differs(&self, other: &Self, epsilon: f32) -> bool {
        self.mode != other.mode
            || !self.position.abs_diff_eq(other.position, epsilon)
            || (self.min_distance - other.min_distance).abs() > epsilon
            || (self.max_distance - other.max_distance).abs() > epsilon
            || (self.inner_cone - other.inner_cone).abs() > epsilon
            || (self.outer_cone - other.outer_cone).abs() > epsilon
            || (self.outer_volume - other.outer_volume).abs() > epsilon
    }
}

/// Listener placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Listener3d {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
}

impl Default for Listener3d {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
        }
    }
}

impl Listener3d {
    /// Normalize orientation vectors, falling back to defaults when degenerate.
    pub fn sanitized(self) -> Self {
        self.sanitized_over(&Self::default())
    }

    /// Like [`Listener3d::sanitized`], but non-finite or degenerate vectors
    /// keep the value from `previous`.
    pub fn sanitized_over(self, previous: &Self) -> Self {
        Self {
            position: finite_or(self.position, previous.position),
            forward: self.forward.try_normalize().unwrap_or(previous.forward),
            up: self.up.try_normalize().unwrap_or(previous.up),
        }
    }

    pub fn differs(&self, other: &Self, epsilon: f32) -> bool {
        !self.position.abs_diff_eq(other.position, epsilon)
            || !self.forward.abs_diff_eq(other.forward, epsilon)
            || !self.up.abs_diff_eq(other.up, epsilon)
    }
}

/// Everything a spatial operator node sends per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialParams {
    pub source: Source3d,
    pub listener: Listener3d,
}

impl SpatialParams {
    pub fn sanitized(self) -> Self {
        self.sanitized_over(&Self::default())
    }

    pub fn sanitized_over(self, previous: &Self) -> Self {
        Self {
            source: self.source.sanitized_over(&previous.source),
            listener: self.listener.sanitized_over(&previous.listener),
        }
    }

    pub fn differs(&self, other: &Self, epsilon: f32) -> bool {
        self.source.differs(&other.source, epsilon)
            || self.listener.differs(&other.listener, epsilon)
    }
}

fn finite_or(value: Vec3, fallback: Vec3) -> Vec3 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn finite_scalar_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
