//! pdhost-demo - headless clip playback and frequency test
//!
//! Without the `libpd` feature the demos run on SimEngine, with loopback
//! routes standing in for the patch's message wiring.

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdhost_core::config::{default_config_path, load_config, AssetConfig, HostConfig};
use pdhost_core::engine::EngineBackend;
use pdhost_core::{AudioTap, PatchHost, SampleBuffer};

#[derive(Parser, Debug)]
#[command(name = "pdhost-demo")]
#[command(about = "Drive Pure Data patches from the command line", long_about = None)]
struct Args {
    /// Host configuration file (default: ~/.config/pdhost/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory patch references are resolved against (overrides config)
    #[arg(long, global = true)]
    assets: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a WAV clip into `sample0` and play it through the patch
    ClipPlayback {
        /// Patch reference relative to the asset root
        #[arg(long)]
        patch: String,

        /// WAV file to load
        #[arg(long)]
        clip: PathBuf,

        /// Value sent to the `pitch` receiver
        #[arg(long, default_value_t = 0.5)]
        pitch: f32,

        /// Number of audio buffers to pull
        #[arg(long, default_value_t = 32)]
        buffers: usize,
    },

    /// Feed a test tone in and print the `frequency` values the patch reports
    FrequencyTest {
        #[arg(long)]
        patch: String,

        /// Value sent to the `inputGain` receiver
        #[arg(long, default_value_t = 0.5)]
        gain: f32,

        /// Test tone frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        tone: f32,

        /// Number of audio buffers to pull
        #[arg(long, default_value_t = 64)]
        buffers: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config: HostConfig = load_config(&config_path);
    if let Some(assets) = &args.assets {
        config.assets = AssetConfig::direct(assets);
    }

    let host = PatchHost::new(make_engine(&config), config).context("Failed to start patch host")?;
    log::info!("pdhost-demo running on the {} engine", host.engine_name());

    let result = match args.command {
        Command::ClipPlayback {
            patch,
            clip,
            pitch,
            buffers,
        } => clip_playback(&host, &patch, &clip, pitch, buffers),
        Command::FrequencyTest {
            patch,
            gain,
            tone,
            buffers,
        } => frequency_test(&host, &patch, gain, tone, buffers),
    };

    host.shutdown();
    result
}

#[cfg(feature = "libpd")]
fn make_engine(config: &HostConfig) -> Arc<dyn EngineBackend> {
    Arc::new(pdhost_core::engine::LibPdEngine::with_search_paths(
        config.search_paths.clone(),
    ))
}

#[cfg(not(feature = "libpd"))]
fn make_engine(config: &HostConfig) -> Arc<dyn EngineBackend> {
    let engine = pdhost_core::engine::SimEngine::with_length_suffix(&config.length_suffix);
    engine.set_call_log_limit(0);
    // [r sample_length] resizes sample0 in the clip patch
    engine.add_length_receiver("sample_length", "sample0");
    // [r inputGain] ... [s frequency] in the frequency patch
    engine.loopback("inputGain", "frequency");
    Arc::new(engine)
}

fn clip_playback(
    host: &PatchHost,
    patch: &str,
    clip: &Path,
    pitch: f32,
    buffers: usize,
) -> Result<()> {
    let id = host
        .create_next(host.config().sample_rate)?
        .wait()
        .context("Instance initialization failed")?;
    host.set_compute_enabled(id, true)?;

    let patch_id = host
        .patches()
        .open(id, patch)?
        .wait()
        .with_context(|| format!("Failed to open patch {}", patch))?;

    let clip = SampleBuffer::from_wav("sample0", clip)
        .with_context(|| format!("Failed to read clip {:?}", clip))?;
    host.buffers()
        .load_buffer_to(id, &clip.name, "sample_length", &clip.samples)?;
    host.router().send_float(id, "pitch", pitch)?;

    let tap = host.audio_tap(id)?;
    let input = vec![0.0; tap.block_len() * 8];
    let (computed, peak) = pull(&tap, buffers, |_| input.clone());

    println!("Clip playback");
    println!("  Instance:  {}", id);
    println!("  Patch:     {} (handle {})", patch, patch_id);
    println!("  Clip:      {} samples", clip.len());
    println!("  Pitch:     {}", pitch);
    println!("  Computed:  {}/{} buffers, peak {:.3}", computed, buffers, peak);

    host.patches().close(id, patch_id)?;
    host.release(id)?;
    Ok(())
}

fn frequency_test(
    host: &PatchHost,
    patch: &str,
    gain: f32,
    tone: f32,
    buffers: usize,
) -> Result<()> {
    let id = host
        .create_next(host.config().sample_rate)?
        .wait()
        .context("Instance initialization failed")?;
    host.set_compute_enabled(id, true)?;

    let patch_id = host
        .patches()
        .open(id, patch)?
        .wait()
        .with_context(|| format!("Failed to open patch {}", patch))?;

    let router = host.router();
    let frequencies = router.listen(id, "frequency")?;
    router.send_float(id, "metroOnOff", 1.0)?;
    router.send_float(id, "inputGain", gain)?;

    // Stand-in for the microphone: a sine tone on every input channel
    let tap = host.audio_tap(id)?;
    let channels = tap.channels();
    let sample_rate = host.config().sample_rate as f32;
    let frames = tap.block_len() * 8 / channels;
    let (computed, _) = pull(&tap, buffers, |n| {
        (0..frames * channels)
            .map(|i| {
                let frame = n * frames + i / channels;
                (TAU * tone * frame as f32 / sample_rate).sin()
            })
            .collect()
    });

    router.poll(id)?;
    let mut received = 0;
    while let Ok(msg) = frequencies.recv_timeout(Duration::from_millis(100)) {
        if let Some(hz) = msg.payload.as_float() {
            println!("  frequency: {:.2}", hz);
            received += 1;
        }
    }

    println!("Frequency test");
    println!("  Instance:  {}", id);
    println!("  Patch:     {} (handle {})", patch, patch_id);
    println!("  Computed:  {}/{} buffers", computed, buffers);
    println!("  Received:  {} frequency values", received);
    if let Some(last) = router.latest_float(id, "frequency")? {
        println!("  Latest:    {:.2}", last);
    }

    router.send_float(id, "metroOnOff", 0.0)?;
    host.patches().close(id, patch_id)?;
    host.release(id)?;
    Ok(())
}

/// Pull `buffers` buffers through the tap; returns (computed, peak)
fn pull(tap: &AudioTap, buffers: usize, mut input: impl FnMut(usize) -> Vec<f32>) -> (usize, f32) {
    let mut computed = 0;
    let mut peak = 0.0f32;
    for n in 0..buffers {
        let input = input(n);
        let mut output = vec![0.0; input.len()];
        if tap.process(&input, &mut output) {
            computed += 1;
            peak = output.iter().fold(peak, |p, s| p.max(s.abs()));
        }
    }
    (computed, peak)
}
