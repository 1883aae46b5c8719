//! Linear-interpolation resampling and channel mapping for the export path.
//!
//! The numeric behaviour here is fixed: output frame `i` reads the input at
//! `i * in_rate / out_rate`, interpolating linearly between the two
//! neighbouring input frames (the last frame is held at the end). Output
//! channel `c` reads input channel `min(c, in_channels - 1)`, so mono is
//! duplicated, extra outputs repeat the last input channel and extra inputs
//! are dropped.

use crate::backend::{AudioBackend, BackendResult, Handle};

/// Describes an interleaved buffer layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub sample_rate: u32,
    pub channels: usize,
}

impl Layout {
    pub const fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Frames held by a buffer of `samples` samples.
    pub fn frames(&self, samples: usize) -> usize {
        samples / self.channels.max(1)
    }
}

/// Input frames needed to produce `out_frames` frames at the output rate.
pub fn frames_needed(out_frames: usize, input: Layout, output: Layout) -> usize {
    if output.sample_rate == 0 {
        return 0;
    }
    let ratio = input.sample_rate as f64 / output.sample_rate as f64;
    (out_frames as f64 * ratio).ceil() as usize + 1
}

/// Resample `input` and add it to `output` scaled by `gain`.
///
/// Non-finite contributions are skipped so a bad source never poisons the
/// mix. Returns the number of output frames touched.
pub fn mix_resampled(
    input: &[f32],
    input_layout: Layout,
    output: &mut [f32],
    output_layout: Layout,
    gain: f32,
) -> usize {
    let in_ch = input_layout.channels;
    let out_ch = output_layout.channels;
    if in_ch == 0 || out_ch == 0 || input_layout.sample_rate == 0 || output_layout.sample_rate == 0
    {
        return 0;
    }

    let in_frames = input.len() / in_ch;
    let ratio = input_layout.sample_rate as f64 / output_layout.sample_rate as f64;
    let mut written = 0;

    for (i, frame) in output.chunks_exact_mut(out_ch).enumerate() {
        let src = i as f64 * ratio;
        let idx = src.floor() as usize;
        if idx >= in_frames {
            break;
        }
        let frac = (src - idx as f64) as f32;

        for (c, slot) in frame.iter_mut().enumerate() {
            let ic = c.min(in_ch - 1);
            let a = input[idx * in_ch + ic];
            let value = if frac == 0.0 {
                a
            } else {
                let b = if idx + 1 < in_frames {
                    input[(idx + 1) * in_ch + ic]
                } else {
                    a
                };
                a + (b - a) * frac
            };
            let value = value * gain;
            if value.is_finite() {
                *slot += value;
            }
        }
        written += 1;
    }
    written
}

/// Resample `input` into `output`, overwriting it. Frames past the end of
/// the input are left silent.
pub fn resample_into(
    input: &[f32],
    input_layout: Layout,
    output: &mut [f32],
    output_layout: Layout,
) -> usize {
    output.fill(0.0);
    mix_resampled(input, input_layout, output, output_layout, 1.0)
}

/// Add `src * gain` into `dst` sample by sample, skipping non-finite
/// contributions.
pub fn mix_finite(dst: &mut [f32], src: &[f32], gain: f32) {
    for (d, s) in dst.iter_mut().zip(src) {
        let value = *s * gain;
        if value.is_finite() {
            *d += value;
        }
    }
}

/// Seek a decode stream to `frame`, pull enough native samples to cover
/// `output` and mix them in at `gain`. Returns output frames touched.
pub fn pull_resampled(
    backend: &dyn AudioBackend,
    handle: Handle,
    frame: u64,
    input: Layout,
    output: &mut [f32],
    output_layout: Layout,
    gain: f32,
) -> BackendResult<usize> {
    backend.set_position(handle, frame, true)?;
    let needed = frames_needed(output_layout.frames(output.len()), input, output_layout);
    let mut native = vec![0.0f32; needed * input.channels];
    let read = backend.read_data(handle, &mut native)?;
    Ok(mix_resampled(&native[..read], input, output, output_layout, gain))
}
