use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ForgeConfig;
use crate::diagnostics::{DiagnosticsSink, Event, Level, LogSink};
use crate::error::{MediaError, MediaResult, ProcessFailure};
use crate::media::MediaHandle;
use crate::process::{CancelSignal, ProcessOutput, ProcessRunner, TokioRunner};

/// Oldest release whose filter set covers everything the engine emits
/// (`xfade`, `amix` with `normalize`).
pub const MIN_FFMPEG_VERSION: FfmpegVersion = FfmpegVersion { major: 5, minor: 0, patch: 0 };

/// Locations of the two external tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain { ffmpeg: PathBuf::from("ffmpeg"), ffprobe: PathBuf::from("ffprobe") }
    }
}

/// FFmpeg version information
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FfmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FfmpegVersion {
    /// Parse version from the first line of `ffmpeg -version`
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FfmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> MediaResult<Self> {
        let unsupported = |why: String| MediaError::UnsupportedToolchain(why);

        // First token that starts with a digit, e.g. "6.1.1-3ubuntu5" or "n7.0"
        let version_part = version_str
            .split_whitespace()
            .map(|s| s.trim_start_matches('n'))
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| unsupported(format!("no version number found in: {}", version_str)))?;

        let mut numbers = version_part.split('.').map(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        let major = numbers
            .next()
            .flatten()
            .ok_or_else(|| unsupported(format!("invalid version format: {}", version_str)))?;
        let minor = numbers.next().flatten().unwrap_or(0);
        let patch = numbers.next().flatten().unwrap_or(0);

        Ok(FfmpegVersion { major, minor, patch })
    }

    pub fn meets_requirement(&self) -> bool {
        *self >= MIN_FFMPEG_VERSION
    }
}

/// Shared context for every operation: the process runner, tool paths,
/// per-call timeout, scratch directory, diagnostics sink and cancellation.
///
/// Operations live in `probe`, `clip`, `compose`, `mixer` and `render` as
/// `impl Engine` blocks. An engine holds no mutable state, so clones can
/// drive independent renders concurrently.
pub struct Engine<R = TokioRunner> {
    runner: Arc<R>,
    tools: Toolchain,
    timeout: Duration,
    scratch_dir: PathBuf,
    diagnostics: Arc<dyn DiagnosticsSink>,
    cancel: CancelSignal,
}

impl<R> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Engine {
            runner: Arc::clone(&self.runner),
            tools: self.tools.clone(),
            timeout: self.timeout,
            scratch_dir: self.scratch_dir.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            cancel: self.cancel.clone(),
        }
    }
}

impl Engine<TokioRunner> {
    /// Engine with the real process runner, logging through the `log` facade
    pub fn from_config(cfg: &ForgeConfig) -> Self {
        Engine::new(
            TokioRunner::new(),
            Toolchain { ffmpeg: cfg.ffmpeg_bin.clone(), ffprobe: cfg.ffprobe_bin.clone() },
            cfg.process_timeout(),
            cfg.scratch_dir.clone(),
            Arc::new(LogSink),
        )
    }
}

impl<R: ProcessRunner> Engine<R> {
    pub fn new(
        runner: R,
        tools: Toolchain,
        timeout: Duration,
        scratch_dir: PathBuf,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Engine {
            runner: Arc::new(runner),
            tools,
            timeout,
            scratch_dir,
            diagnostics,
            cancel: CancelSignal::never(),
        }
    }

    /// Same engine observing a different cancellation signal
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tools(&self) -> &Toolchain {
        &self.tools
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub(crate) fn emit(&self, level: Level, stage: &'static str, message: impl Into<String>) {
        self.diagnostics.record(Event { level, stage, message: message.into() });
    }

    /// Run `ffmpeg -version` and check it is recent enough
    pub async fn verify_toolchain(&self) -> MediaResult<FfmpegVersion> {
        let argv = vec![self.tools.ffmpeg.to_string_lossy().to_string(), "-version".to_string()];
        let output = self.run_argv("toolchain", argv).await?;
        let first_line = output
            .stdout
            .lines()
            .next()
            .ok_or_else(|| MediaError::UnsupportedToolchain("empty output from ffmpeg -version".to_string()))?;

        let version = FfmpegVersion::parse(first_line)?;
        if !version.meets_requirement() {
            return Err(MediaError::UnsupportedToolchain(format!(
                "ffmpeg {}.{}.{} is older than the required {}.{}",
                version.major, version.minor, version.patch, MIN_FFMPEG_VERSION.major, MIN_FFMPEG_VERSION.minor
            )));
        }
        self.emit(
            Level::Info,
            "toolchain",
            format!("ffmpeg {}.{}.{} detected", version.major, version.minor, version.patch),
        );
        Ok(version)
    }

    /// Full transcoder argv: binary, common flags, then `args`
    pub(crate) fn ffmpeg_argv(&self, loglevel: &str, args: Vec<String>) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 7);
        argv.push(self.tools.ffmpeg.to_string_lossy().to_string());
        argv.push("-y".to_string());
        argv.push("-hide_banner".to_string());
        argv.push("-nostdin".to_string());
        argv.push("-loglevel".to_string());
        argv.push(loglevel.to_string());
        argv.extend(args);
        argv
    }

    /// Single attempt at one external command, with diagnostics around it
    pub(crate) async fn run_argv(&self, stage: &'static str, argv: Vec<String>) -> Result<ProcessOutput, ProcessFailure> {
        self.emit(Level::Debug, stage, format!("exec: {}", argv.join(" ")));
        match self.runner.run(&argv, self.timeout, &self.cancel).await {
            Ok(output) => {
                self.emit(Level::Debug, stage, "command completed");
                Ok(output)
            }
            Err(failure) => {
                self.emit(Level::Warn, stage, failure.to_string());
                Err(failure)
            }
        }
    }

    /// Run the transcoder and hand back a handle to the file it was asked to write
    pub(crate) async fn transcode(&self, stage: &'static str, args: Vec<String>, output: &Path) -> MediaResult<MediaHandle> {
        let argv = self.ffmpeg_argv("error", args);
        self.run_argv(stage, argv).await?;
        let handle = MediaHandle::new(output).map_err(|_| MediaError::MissingOutput(output.to_path_buf()))?;
        self.emit(Level::Info, stage, format!("wrote {}", handle));
        Ok(handle)
    }
}

/// Refuse to write over one of the inputs; every stage writes a new file
pub(crate) fn check_output<'a>(output: &Path, inputs: impl IntoIterator<Item = &'a MediaHandle>) -> MediaResult<()> {
    for input in inputs {
        if input.path() == output {
            return Err(MediaError::InvalidParameter(format!(
                "output {} would overwrite an input",
                output.display()
            )));
        }
    }
    Ok(())
}

/// Seconds formatted for the transcoder's option parser
pub(crate) fn secs(value: f64) -> String {
    format!("{:.3}", value)
}
