//! Hardware output through cpal.
//!
//! The cpal callback pulls the realtime Global bus out of the software
//! backend. Stream errors are forwarded over a channel; the host drains it
//! and calls `AudioEngine::on_device_changed`.

use crate::backend::SoftwareBackend;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use opmix_core::{OpMixError, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Something happened to the output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device went away (unplugged, default changed).
    Disconnected,
    /// Any other stream error reported by the host.
    StreamError(String),
}

/// Native sample rate of the default output device.
pub fn default_output_rate() -> Option<u32> {
    let device = cpal::default_host().default_output_device()?;
    match device.default_output_config() {
        Ok(config) => Some(config.sample_rate().0),
        Err(e) => {
            warn!(error = %e, "Could not query default output config");
            None
        }
    }
}

/// A running output stream. Dropping it stops output.
pub struct DeviceOutput {
    _stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl DeviceOutput {
    /// Open the default output device at `sample_rate` and start pulling
    /// `backend`.
    pub fn start(
        backend: Arc<SoftwareBackend>,
        sample_rate: u32,
        events: Sender<DeviceEvent>,
    ) -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| OpMixError::Audio("No default output device".into()))?;
        let device_name = device.name().unwrap_or_else(|_| "<unknown>".into());
        let supported = device
            .default_output_config()
            .map_err(|e| OpMixError::Audio(format!("Output config unavailable: {e}")))?;
        let channels = supported.channels();
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let out_channels = channels as usize;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    backend.render_output(data, out_channels);
                },
                move |err| {
                    error!(error = %err, "Audio output stream error");
                    let event = match err {
                        cpal::StreamError::DeviceNotAvailable => DeviceEvent::Disconnected,
                        other => DeviceEvent::StreamError(other.to_string()),
                    };
                    let _ = events.send(event);
                },
                None,
            )
            .map_err(|e| OpMixError::Audio(format!("Failed to build output stream: {e}")))?;
        stream
            .play()
            .map_err(|e| OpMixError::Audio(format!("Failed to start output stream: {e}")))?;

        info!(device = %device_name, sample_rate, channels, "Audio output started");
        Ok(Self {
            _stream: stream,
            device_name,
            sample_rate,
            channels,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}
