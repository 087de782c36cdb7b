//! framelock Demo Application
//!
//! Headless playback of a file (or a `synthetic://` clip) with optional
//! frame-exact seeks, printing sync statistics at the end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use framelock_core::{
    AudioSink, CpuFrame, FrameIndex, HwAccelConfig, HwAccelType, MediaBackend, PlaybackState,
    Player, PlayerConfig, SyntheticBackend, VirtualSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HwArg {
    Auto,
    None,
    Cuda,
    Qsv,
    Vaapi,
    D3d11va,
    Videotoolbox,
}

impl From<HwArg> for HwAccelType {
    fn from(arg: HwArg) -> Self {
        match arg {
            HwArg::Auto => HwAccelType::platform_default(),
            HwArg::None => HwAccelType::None,
            HwArg::Cuda => HwAccelType::Cuda,
            HwArg::Qsv => HwAccelType::Qsv,
            HwArg::Vaapi => HwAccelType::Vaapi,
            HwArg::D3d11va => HwAccelType::D3d11va,
            HwArg::Videotoolbox => HwAccelType::VideoToolbox,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "framelock-demo", about = "Frame-exact headless player")]
struct Args {
    /// Media file, or synthetic://clip?fps=30&seconds=10
    #[arg(default_value = "synthetic://clip?fps=30&seconds=10")]
    input: String,

    /// Frames to seek to after playback starts, in order
    #[arg(long = "seek", value_name = "FRAME")]
    seeks: Vec<FrameIndex>,

    /// Seconds to play before stopping (default: until the end)
    #[arg(long)]
    duration: Option<f64>,

    /// Decoded frames buffered ahead of presentation
    #[arg(long, default_value_t = framelock_core::config::DEFAULT_FRAME_CAP)]
    frame_cap: usize,

    /// Hardware decoder to request
    #[arg(long, value_enum, default_value_t = HwArg::Auto)]
    hw: HwArg,

    /// Fail instead of falling back to software decoding
    #[arg(long)]
    no_fallback: bool,

    /// Ignore the audio track
    #[arg(long)]
    no_audio: bool,

    /// Use the virtual clock even when an audio device is available
    #[arg(long)]
    virtual_audio: bool,
}

impl Args {
    fn player_config(&self) -> PlayerConfig {
        let hw = HwAccelConfig {
            hw_type: self.hw.into(),
            fallback_to_software: !self.no_fallback,
        };
        PlayerConfig::default()
            .with_frame_cap(self.frame_cap)
            .with_audio(!self.no_audio)
            .with_hw_accel(hw)
    }

    fn is_synthetic(&self) -> bool {
        self.input.starts_with("synthetic://")
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("framelock_core=info".parse()?)
                .add_directive("framelock_demo=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let sink = open_sink(&args);

    if args.is_synthetic() {
        return run::<SyntheticBackend>(&args, sink);
    }
    #[cfg(feature = "ffmpeg")]
    {
        run::<framelock_core::FfmpegBackend>(&args, sink)
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        bail!(
            "{} is not a synthetic:// clip; rebuild with --features ffmpeg to play files",
            args.input
        )
    }
}

fn open_sink(args: &Args) -> Arc<dyn AudioSink> {
    #[cfg(feature = "cpal")]
    {
        if !args.virtual_audio && !args.no_audio {
            return Arc::new(framelock_core::CpalSink::new());
        }
    }
    #[cfg(not(feature = "cpal"))]
    let _ = args;
    VirtualSink::real_time()
}

fn run<B: MediaBackend>(args: &Args, sink: Arc<dyn AudioSink>) -> anyhow::Result<()> {
    let mut shown: u64 = 0;
    let presenter = move |frame: &CpuFrame, index: FrameIndex| {
        shown += 1;
        if shown % 30 == 1 {
            tracing::debug!("Presented frame {} ({}x{})", index, frame.width, frame.height);
        }
    };

    let player = Player::<B>::open_file_with(&args.input, sink, presenter, args.player_config())
        .with_context(|| format!("failed to open {}", args.input))?;

    let info = player.media_info();
    tracing::info!(
        "{}: {}x{}, {:.3} fps, {} frames, {} ms",
        args.input,
        info.video.width,
        info.video.height,
        player.timing().fps(),
        player.total_frame_count(),
        info.duration_ms()
    );

    player.play()?;
    let started = Instant::now();

    for &target in &args.seeks {
        std::thread::sleep(Duration::from_millis(500));
        let seek_started = Instant::now();
        if !player.seek_to_exact_frame(target) {
            bail!("seek to frame {target} failed");
        }
        tracing::info!(
            "Seek to {} landed on {} in {:?}",
            target,
            player.frame_index(),
            seek_started.elapsed()
        );
        player.play()?;
    }

    let limit = args
        .duration
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::MAX);
    while started.elapsed() < limit {
        let state = player.wait_for_state(Duration::from_millis(250), |s| {
            matches!(s, PlaybackState::Ended | PlaybackState::Stopped)
        });
        if matches!(state, PlaybackState::Ended | PlaybackState::Stopped) {
            break;
        }
    }

    if let Some(err) = player.take_error() {
        player.stop();
        return Err(err).context("playback failed");
    }

    let snapshot = player.metrics().snapshot();
    player.stop();
    println!(
        "frames presented: {}, skipped: {}, untransferred: {}, undecodable: {}, underruns: {}, self-heals: {}",
        snapshot.frames_presented,
        snapshot.frames_skipped,
        snapshot.frames_untransferred,
        snapshot.frames_undecodable,
        snapshot.underrun_count,
        snapshot.self_heal_count
    );
    println!(
        "seeks: {} fast, {} slow, {} failed; sync quality: {} (max drift {} ms)",
        snapshot.fast_seeks,
        snapshot.slow_seeks,
        snapshot.failed_seeks,
        snapshot.quality(),
        snapshot.max_abs_drift_ms()
    );
    Ok(())
}
