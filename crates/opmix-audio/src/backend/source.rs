//! Decoded PCM sources for the software backend.

use std::path::Path;
use std::sync::Arc;

use super::{BackendError, BackendResult, ErrorCode};

/// Fully decoded interleaved f32 audio.
#[derive(Debug, Clone)]
pub struct DecodedSource {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedSource {
    /// Wrap interleaved samples. Trailing partial frames are dropped.
    pub fn from_interleaved(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let mut samples = samples;
        let whole = samples.len() - samples.len() % channels as usize;
        samples.truncate(whole);
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    /// Decode a WAV file.
    pub fn load_wav(path: &Path) -> BackendResult<Self> {
        let reader = hound::WavReader::open(path).map_err(|e| match e {
            hound::Error::IoError(_) => BackendError::new("create_file_stream", ErrorCode::FileOpen),
            _ => BackendError::new("create_file_stream", ErrorCode::FileFormat),
        })?;
        let spec = reader.spec();
        let format_error = |_| BackendError::new("create_file_stream", ErrorCode::FileFormat);

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(format_error)?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()
                    .map_err(format_error)?
            }
        };

        Ok(Self::from_interleaved(samples, spec.sample_rate, spec.channels))
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Self {
        if self.channels == 1 {
            return self.clone();
        }
        let channels = self.channels as usize;
        let mono: Vec<f32> = self
            .samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Self::from_interleaved(mono, self.sample_rate, 1)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Length in frames.
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels as usize) as u64
    }

    /// Sample of `channel` at `frame`, or silence past the end.
    #[inline]
    pub fn sample(&self, frame: u64, channel: usize) -> f32 {
        let idx = frame as usize * self.channels as usize + channel;
        self.samples.get(idx).copied().unwrap_or(0.0)
    }
}
