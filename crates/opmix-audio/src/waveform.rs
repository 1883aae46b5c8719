//! Min/max waveform reduction for overview displays.

use serde::{Deserialize, Serialize};

/// Amplitude range covered by one waveform column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformSample {
    pub min: f32,
    pub max: f32,
}

/// Reduced waveform of one mono signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waveform {
    /// Source samples folded into each column.
    pub samples_per_pixel: usize,
    pub data: Vec<WaveformSample>,
    pub sample_rate: u32,
}

impl Waveform {
    /// Create an empty waveform to be filled incrementally with [`push_block`].
    ///
    /// [`push_block`]: Waveform::push_block
    pub fn empty(samples_per_pixel: usize, sample_rate: u32) -> Self {
        Self {
            samples_per_pixel: samples_per_pixel.max(1),
            data: Vec::new(),
            sample_rate,
        }
    }

    /// Reduce mono `samples` to one min/max pair per `samples_per_pixel`.
    ///
    /// Non-finite samples are ignored; a column with none left reads as 0.
    pub fn compute(samples: &[f32], samples_per_pixel: usize, sample_rate: u32) -> Self {
        let mut waveform = Self::empty(samples_per_pixel, sample_rate);
        if samples_per_pixel == 0 {
            return waveform;
        }
        waveform.data = samples
            .chunks(waveform.samples_per_pixel)
            .map(reduce)
            .collect();
        waveform
    }

    /// Append columns for a block whose length is a multiple of
    /// `samples_per_pixel` (a trailing partial column is reduced as-is).
    pub fn push_block(&mut self, samples: &[f32]) {
        self.data
            .extend(samples.chunks(self.samples_per_pixel).map(reduce));
    }

    /// RMS of the column peaks in `[start_pixel, end_pixel)`.
    pub fn rms_range(&self, start_pixel: usize, end_pixel: usize) -> f32 {
        let end = end_pixel.min(self.data.len());
        let start = start_pixel.min(end);
        if start == end {
            return 0.0;
        }
        let sum: f64 = self.data[start..end]
            .iter()
            .map(|s| (s.max.abs().max(s.min.abs()) as f64).powi(2))
            .sum();
        (sum / (end - start) as f64).sqrt() as f32
    }

    /// Largest absolute amplitude.
    pub fn peak(&self) -> f32 {
        self.data
            .iter()
            .map(|s| s.max.abs().max(s.min.abs()))
            .fold(0.0, f32::max)
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.data.len() * self.samples_per_pixel) as f64 / self.sample_rate as f64
    }
}

fn reduce(chunk: &[f32]) -> WaveformSample {
    let mut range: Option<WaveformSample> = None;
    for &s in chunk.iter().filter(|s| s.is_finite()) {
        let r = range.get_or_insert(WaveformSample { min: s, max: s });
        r.min = r.min.min(s);
        r.max = r.max.max(s);
    }
    range.unwrap_or_default()
}
