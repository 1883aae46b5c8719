//! OpMix - Operator audio engine
//!
//! Headless entry point:
//! - `opmix play <file> [seconds]` plays a file as one operator node on the
//!   default output device.
//! - `opmix export <file> <out.wav> [seconds] [fps]` renders the file as a
//!   soundtrack clip through the export mixdown into a float WAV.

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use opmix_audio::device::{default_output_rate, DeviceEvent, DeviceOutput};
use opmix_audio::{AudioConfig, AudioEngine, Bus, SoftwareBackend, SoundtrackClip};
use opmix_core::{FrameRate, NodeId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const USAGE: &str = "usage: opmix play <file> [seconds]\n       opmix export <file> <out.wav> [seconds] [fps]";

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("OpMix starting...");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("play") => {
            let input = args.get(1).map(PathBuf::from).context(USAGE)?;
            let seconds = parse_arg(&args, 2, 10.0)?;
            play(&input, seconds)
        }
        Some("export") => {
            let input = args.get(1).map(PathBuf::from).context(USAGE)?;
            let output = args.get(2).map(PathBuf::from).context(USAGE)?;
            let seconds = args.get(3).map(|s| s.parse::<f64>()).transpose()?;
            let fps = FrameRate::from_fps_f64(parse_arg(&args, 4, 30.0)?);
            export(&input, &output, seconds, fps)
        }
        _ => bail!(USAGE),
    }
}

fn parse_arg(args: &[String], index: usize, default: f64) -> Result<f64> {
    match args.get(index) {
        Some(s) => s
            .parse()
            .with_context(|| format!("expected a number, got {s:?}")),
        None => Ok(default),
    }
}

fn open_output(
    engine: &AudioEngine,
    backend: &Arc<SoftwareBackend>,
) -> Result<(DeviceOutput, Receiver<DeviceEvent>)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let rate = engine
        .topology()
        .sample_rate()
        .context("audio engine is not initialized")?;
    let output = DeviceOutput::start(backend.clone(), rate, tx)?;
    Ok((output, rx))
}

fn play(input: &Path, seconds: f64) -> Result<()> {
    let backend = Arc::new(SoftwareBackend::new());
    backend.set_device_rate(default_output_rate());

    let mut engine = AudioEngine::new(backend.clone(), AudioConfig::load_or_default());
    if !engine.initialize() {
        bail!("audio initialization failed");
    }
    let (mut output, mut events) = open_output(&engine, &backend)?;
    info!(device = output.device_name(), "Playing {}", input.display());

    let node = NodeId::from_path(["opmix", "play"]);
    let fps = FrameRate::FPS_60;
    let frame = Duration::from_secs_f64(fps.frame_duration_secs());
    let start = Instant::now();

    for index in 0..fps.frames_in(seconds) {
        engine.update_stereo_operator(node, input, true, false, 1.0, false, 0.0, 1.0, 0.0);
        engine.complete_frame();

        if events.try_recv().is_ok() {
            while events.try_recv().is_ok() {}
            drop(output);
            backend.set_device_rate(default_output_rate());
            engine.on_device_changed();
            (output, events) = open_output(&engine, &backend)?;
        }

        if index % 60 == 0 {
            info!(
                playing = engine.is_operator_playing(node),
                level = engine.operator_level(node),
                global = engine.bus_level(Bus::Global),
                "t = {:.1}s",
                start.elapsed().as_secs_f64()
            );
        }

        let next = start + frame * (index as u32 + 1);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    engine.unregister_operator(node);
    Ok(())
}

fn export(input: &Path, output: &Path, seconds: Option<f64>, fps: FrameRate) -> Result<()> {
    let seconds = match seconds {
        Some(s) => s,
        None => {
            let reader = hound::WavReader::open(input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            reader.duration() as f64 / reader.spec().sample_rate as f64
        }
    };

    let backend = Arc::new(SoftwareBackend::new());
    let mut engine = AudioEngine::new(backend, AudioConfig::load_or_default());
    if !engine.add_soundtrack_clip(SoundtrackClip::new(input, 0.0, seconds)) {
        bail!("could not load {}", input.display());
    }
    engine.prepare_recording(fps).context("export could not start")?;
    let sample_rate = engine
        .topology()
        .sample_rate()
        .context("audio engine is not initialized")?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let result = write_mixdown(&mut engine, output, spec, seconds, fps);
    // Always hand audio back, even if writing failed.
    engine.end_recording(fps);
    let frames = result?;
    info!(frames, path = %output.display(), "Export complete");
    Ok(())
}

fn write_mixdown(
    engine: &mut AudioEngine,
    output: &Path,
    spec: hound::WavSpec,
    seconds: f64,
    fps: FrameRate,
) -> Result<u64> {
    let mut writer = hound::WavWriter::create(output, spec)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let frames = fps.frames_in(seconds);
    for index in 0..frames {
        let buffer = engine.get_full_mixdown_buffer(fps.frame_duration_secs(), fps.frame_time(index));
        for sample in buffer {
            writer.write_sample(sample)?;
        }
        if index > 0 && index % 300 == 0 {
            info!(frame = index, of = frames, "Exporting");
        }
    }
    writer.finalize()?;
    if frames == 0 {
        warn!("Nothing to export");
    }
    Ok(frames)
}
