use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use mediaforge::{
    cancel_pair, AudioFormat, AudioTrack, Engine, ForgeConfig, Manifest, MediaHandle, Pipeline, Position, RenderSpec,
    Resolution, TimeRange,
};

/// Video assembly and rendering on top of ffmpeg/ffprobe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Per-invocation timeout in seconds (overrides the configuration)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that ffmpeg is installed and recent enough
    Check,
    /// Print stream metadata as JSON
    Probe { input: PathBuf },
    /// Cut a range with fade-in and fade-out
    Extract {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        /// Fade length in seconds (default from configuration)
        #[arg(long)]
        fade: Option<f64>,
    },
    /// Loudness-normalize the audio track
    Normalize {
        input: PathBuf,
        output: PathBuf,
        /// Integrated loudness target (default: the configured level for --role)
        #[arg(long, allow_hyphen_values = true)]
        lufs: Option<f64>,
        #[arg(long, value_enum, default_value_t = Role::Clip)]
        role: Role,
    },
    /// Demux the audio stream
    ExtractAudio {
        input: PathBuf,
        output: PathBuf,
        /// wav, mp3, flac, aac or opus
        #[arg(long, default_value = "wav")]
        format: String,
    },
    /// List scene change timestamps
    Scenes {
        input: PathBuf,
        #[arg(long, default_value_t = 0.3)]
        threshold: f64,
    },
    /// Generate stereo silence
    Silence {
        output: PathBuf,
        #[arg(long)]
        duration: f64,
        /// Sample rate (default from configuration)
        #[arg(long)]
        sample_rate: Option<u32>,
    },
    /// Join clips with crossfades
    Concat {
        #[arg(short, long)]
        output: PathBuf,
        /// Crossfade length in seconds (default from configuration)
        #[arg(long)]
        crossfade: Option<f64>,
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,
    },
    /// Burn text into a video
    OverlayText {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        text: String,
        #[arg(long)]
        font: PathBuf,
        /// Top-left corner as X,Y
        #[arg(long, default_value = "0,0", value_parser = parse_position)]
        position: Position,
        #[arg(long, default_value_t = 48)]
        size: u32,
        #[arg(long, default_value = "white")]
        color: String,
    },
    /// Draw an image over a video
    OverlayImage {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        image: PathBuf,
        /// Top-left corner as X,Y
        #[arg(long, default_value = "0,0", value_parser = parse_position)]
        position: Position,
        /// Only show the image for the first N seconds
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Mix audio tracks; each track is PATH[@DB[@OFFSET_SECS]]
    Mix {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(required = true)]
        tracks: Vec<String>,
    },
    /// Render from a RenderSpec JSON file
    Render { spec: PathBuf, output: PathBuf },
    /// Run the whole pipeline from a manifest JSON file
    Run { manifest: PathBuf },
    /// Cut a vertical short out of a finished video
    Short {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        /// WIDTHxHEIGHT (default from configuration)
        #[arg(long)]
        resolution: Option<Resolution>,
    },
}

/// What a normalized track is used for; picks the configured loudness
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Clip,
    Narration,
    Music,
}

impl Role {
    fn lufs(self, cfg: &ForgeConfig) -> f64 {
        match self {
            Role::Clip => cfg.audio.clip_audio_lufs,
            Role::Narration => cfg.audio.narration_lufs,
            Role::Music => cfg.audio.music_lufs,
        }
    }
}

fn parse_position(s: &str) -> Result<Position, String> {
    let (x, y) = s.split_once(',').ok_or_else(|| format!("expected X,Y, got {:?}", s))?;
    let x = x.trim().parse::<i32>().map_err(|e| format!("bad x in {:?}: {}", s, e))?;
    let y = y.trim().parse::<i32>().map_err(|e| format!("bad y in {:?}: {}", s, e))?;
    Ok(Position::new(x, y))
}

/// `PATH[@DB[@OFFSET]]`
fn parse_track(s: &str) -> Result<AudioTrack> {
    let mut parts = s.split('@');
    let path = parts.next().filter(|p| !p.is_empty()).with_context(|| format!("empty track spec {:?}", s))?;
    let volume_db = match parts.next() {
        Some(db) => db.parse::<f64>().with_context(|| format!("bad volume in {:?}", s))?,
        None => 0.0,
    };
    let offset = match parts.next() {
        Some(off) => off.parse::<f64>().with_context(|| format!("bad offset in {:?}", s))?,
        None => 0.0,
    };
    if parts.next().is_some() {
        bail!("too many fields in track spec {:?}", s);
    }
    let handle = MediaHandle::new(path).with_context(|| format!("track not found: {}", path))?;
    Ok(AudioTrack::new(handle, volume_db).with_offset(offset))
}

fn handle(path: &Path) -> Result<MediaHandle> {
    MediaHandle::new(path).with_context(|| format!("Input not found: {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let mut cfg = ForgeConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(secs) = args.timeout {
        cfg.process_timeout_secs = secs;
    }
    info!(
        "Using ffmpeg={} ffprobe={} timeout={}s",
        cfg.ffmpeg_bin.display(),
        cfg.ffprobe_bin.display(),
        cfg.process_timeout_secs
    );

    // Ctrl-C terminates whatever external process is running
    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });
    let engine = Engine::from_config(&cfg).with_cancel(signal);

    execute(&cfg, &engine, args.command).await
}

async fn execute(cfg: &ForgeConfig, engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            let version = engine.verify_toolchain().await.context("ffmpeg check failed")?;
            println!("ffmpeg {}.{}.{} OK", version.major, version.minor, version.patch);
        }
        Command::Probe { input } => {
            let info = engine.inspect(&handle(&input)?).await.context("Probe failed")?;
            print_json(&info)?;
        }
        Command::Extract { input, output, start, end, fade } => {
            let range = TimeRange::new(start, end)?;
            let fade = fade.unwrap_or(cfg.video.fade_seconds);
            let out = engine.extract_clip(&handle(&input)?, range, fade, &output).await?;
            println!("{}", out);
        }
        Command::Normalize { input, output, lufs, role } => {
            let lufs = lufs.unwrap_or_else(|| role.lufs(cfg));
            let out = engine.normalize_audio(&handle(&input)?, lufs, &output).await?;
            println!("{}", out);
        }
        Command::ExtractAudio { input, output, format } => {
            let format: AudioFormat = format.parse()?;
            let out = engine.extract_audio(&handle(&input)?, format, &output).await?;
            println!("{}", out);
        }
        Command::Scenes { input, threshold } => {
            let stamps = engine.detect_scene_boundaries(&handle(&input)?, threshold).await?;
            print_json(&stamps)?;
        }
        Command::Silence { output, duration, sample_rate } => {
            let rate = sample_rate.unwrap_or(cfg.audio.sample_rate);
            let out = engine.create_silent_audio(duration, rate, &output).await?;
            println!("{}", out);
        }
        Command::Concat { output, crossfade, inputs } => {
            let handles = inputs.iter().map(|p| handle(p)).collect::<Result<Vec<_>>>()?;
            let crossfade = crossfade.unwrap_or(cfg.video.crossfade_seconds);
            let out = engine.concatenate(&handles, crossfade, &output).await?;
            println!("{}", out);
        }
        Command::OverlayText { input, output, text, font, position, size, color } => {
            let out = engine.overlay_text(&handle(&input)?, &text, position, &font, size, &color, &output).await?;
            println!("{}", out);
        }
        Command::OverlayImage { input, output, image, position, duration } => {
            let out = engine
                .overlay_image(&handle(&input)?, &handle(&image)?, position, duration, &output)
                .await?;
            println!("{}", out);
        }
        Command::Mix { output, tracks } => {
            let tracks = tracks.iter().map(|t| parse_track(t)).collect::<Result<Vec<_>>>()?;
            let out = engine.mix(&tracks, &output).await?;
            println!("{}", out);
        }
        Command::Render { spec, output } => {
            let spec: RenderSpec = read_json(&spec)?;
            let out = engine.render(&spec, &output).await?;
            println!("{}", out);
        }
        Command::Run { manifest } => {
            let manifest: Manifest = read_json(&manifest)?;
            let pipeline = Pipeline::new(engine.clone());
            match pipeline.run(&manifest).await {
                Ok(report) => print_json(&report)?,
                Err(e) => {
                    for path in &e.completed {
                        info!("Intermediate kept: {}", path.display());
                    }
                    return Err(e).context("Pipeline run failed");
                }
            }
        }
        Command::Short { input, output, start, end, resolution } => {
            let range = TimeRange::new(start, end)?;
            let resolution = resolution.unwrap_or(cfg.video.short_resolution);
            let out = engine.derive_short(&handle(&input)?, range, resolution, &output).await?;
            println!("{}", out);
        }
    }
    Ok(())
}
