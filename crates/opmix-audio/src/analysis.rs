//! Waveform and spectrum analysis of whatever the engine last produced.
//!
//! Live, the engine feeds a peek of the global bus each frame; during export
//! it feeds the mixdown buffer instead, so analysis-driven nodes see the
//! audio that is actually being written.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

/// Mono samples kept for analysis.
pub const ANALYSIS_WINDOW: usize = 1024;

/// Samples returned by [`AudioAnalysis::waveform`].
pub const WAVEFORM_LEN: usize = 512;

/// Bins returned by the spectrum queries.
pub const SPECTRUM_BINS: usize = ANALYSIS_WINDOW / 2;

/// Weight of the previous spectrum when smoothing.
const SPECTRUM_DAMPING: f32 = 0.7;

/// Hann-windowed magnitude spectrum over [`ANALYSIS_WINDOW`] samples.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(ANALYSIS_WINDOW);
        let window = (0..ANALYSIS_WINDOW)
            .map(|i| {
                let phase = std::f32::consts::TAU * i as f32 / (ANALYSIS_WINDOW - 1) as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        Self {
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); ANALYSIS_WINDOW],
        }
    }

    /// Magnitudes of the most recent `ANALYSIS_WINDOW` samples.
    ///
    /// Shorter input is zero-padded at the front; non-finite samples count
    /// as silence.
    pub fn magnitudes(&mut self, samples: &[f32]) -> Vec<f32> {
        let take = samples.len().min(ANALYSIS_WINDOW);
        let pad = ANALYSIS_WINDOW - take;
        let recent = &samples[samples.len() - take..];

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let s = if i < pad { 0.0 } else { recent[i - pad] };
            let s = if s.is_finite() { s } else { 0.0 };
            *slot = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let norm = 2.0 / ANALYSIS_WINDOW as f32;
        self.buffer[..SPECTRUM_BINS]
            .iter()
            .map(|c| c.norm() * norm)
            .collect()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling mono history plus a damped spectrum.
pub struct AudioAnalysis {
    analyzer: SpectrumAnalyzer,
    history: VecDeque<f32>,
    spectrum: Vec<f32>,
}

impl AudioAnalysis {
    pub fn new() -> Self {
        Self {
            analyzer: SpectrumAnalyzer::new(),
            history: VecDeque::with_capacity(ANALYSIS_WINDOW),
            spectrum: vec![0.0; SPECTRUM_BINS],
        }
    }

    /// Drop all history and smoothing state.
    pub fn reset(&mut self) {
        self.history.clear();
        self.spectrum.fill(0.0);
    }

    /// Feed interleaved audio. Frames are folded to mono from their finite
    /// channels; a frame with no finite sample is skipped.
    pub fn push_interleaved(&mut self, samples: &[f32], channels: usize) {
        let channels = channels.max(1);
        for frame in samples.chunks_exact(channels) {
            let (sum, count) = frame
                .iter()
                .filter(|s| s.is_finite())
                .fold((0.0f32, 0usize), |(sum, n), s| (sum + s, n + 1));
            if count == 0 {
                continue;
            }
            if self.history.len() == ANALYSIS_WINDOW {
                self.history.pop_front();
            }
            self.history.push_back(sum / count as f32);
        }

        let recent: Vec<f32> = self.history.iter().copied().collect();
        let magnitudes = self.analyzer.magnitudes(&recent);
        for (smoothed, m) in self.spectrum.iter_mut().zip(magnitudes) {
            if m.is_finite() {
                *smoothed = *smoothed * SPECTRUM_DAMPING + m * (1.0 - SPECTRUM_DAMPING);
            }
        }
    }

    /// The last [`WAVEFORM_LEN`] mono samples, oldest first.
    pub fn waveform(&self) -> Vec<f32> {
        recent_mono(self.history.iter().copied(), self.history.len())
    }

    /// Damped magnitude spectrum, [`SPECTRUM_BINS`] long.
    pub fn spectrum(&self) -> &[f32] {
        &self.spectrum
    }

    pub fn analyzer_mut(&mut self) -> &mut SpectrumAnalyzer {
        &mut self.analyzer
    }
}

impl Default for AudioAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold interleaved stereo to mono and keep the last [`WAVEFORM_LEN`]
/// samples, zero-padded at the front.
pub fn waveform_from_stereo(stereo: &[f32]) -> Vec<f32> {
    let mono = stereo.chunks_exact(2).map(|f| {
        let v = (f[0] + f[1]) * 0.5;
        if v.is_finite() {
            v
        } else {
            0.0
        }
    });
    recent_mono(mono, stereo.len() / 2)
}

fn recent_mono(samples: impl Iterator<Item = f32>, len: usize) -> Vec<f32> {
    let take = len.min(WAVEFORM_LEN);
    let mut out = vec![0.0; WAVEFORM_LEN - take];
    out.extend(samples.skip(len - take));
    out
}
