//! Frame timing for offline export.
//!
//! Export runs frame by frame at a video frame rate. Frame start times are
//! computed with rational arithmetic so that long exports do not drift.

use num_rational::Rational64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Video frame rate as a rational number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    /// Create a new frame rate.
    #[inline]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Approximate a float rate (e.g. from a settings dialog).
    ///
    /// NTSC rates are snapped to their exact rational form.
    pub fn from_fps_f64(fps: f64) -> Self {
        const NTSC: [FrameRate; 3] = [
            FrameRate::FPS_23_976,
            FrameRate::FPS_29_97,
            FrameRate::FPS_59_94,
        ];
        if let Some(rate) = NTSC
            .iter()
            .find(|rate| (rate.to_fps_f64() - fps).abs() < 0.005)
        {
            return *rate;
        }
        if fps.fract().abs() < 1e-9 && fps >= 1.0 {
            return Self::new(fps as u32, 1);
        }
        Self::new((fps * 1000.0).round().max(1.0) as u32, 1000)
    }

    /// Frames per second as f64.
    #[inline]
    pub fn to_fps_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Duration of one frame in seconds.
    #[inline]
    pub fn frame_duration_secs(self) -> f64 {
        self.denominator as f64 / self.numerator as f64
    }

    /// Exact start time of `frame` in seconds.
    pub fn frame_time(self, frame: u64) -> f64 {
        let t = Rational64::new(
            frame as i64 * self.denominator as i64,
            self.numerator as i64,
        );
        *t.numer() as f64 / *t.denom() as f64
    }

    /// Number of whole frames covering `seconds`.
    pub fn frames_in(self, seconds: f64) -> u64 {
        (seconds * self.to_fps_f64()).ceil().max(0.0) as u64
    }

    pub const FPS_23_976: Self = Self::new(24000, 1001);
    pub const FPS_24: Self = Self::new(24, 1);
    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_29_97: Self = Self::new(30000, 1001);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_50: Self = Self::new(50, 1);
    pub const FPS_59_94: Self = Self::new(60000, 1001);
    pub const FPS_60: Self = Self::new(60, 1);
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FPS_60
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{} fps", self.numerator)
        } else {
            write!(f, "{:.3} fps", self.to_fps_f64())
        }
    }
}
