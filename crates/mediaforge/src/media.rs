use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, MediaResult};

/// Absolute path to a media file that existed when the handle was created.
///
/// Every stage returns a fresh handle for the file it wrote; nothing in the
/// crate rewrites a file behind an existing handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct MediaHandle(PathBuf);

impl MediaHandle {
    pub fn new(path: impl Into<PathBuf>) -> MediaResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(MediaError::InputNotFound(path));
        }
        let path = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(|_| MediaError::InputNotFound(path.clone()))?
                .join(path)
        };
        Ok(MediaHandle(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Re-check existence; handles can go stale if someone deletes the file
    pub fn ensure_exists(&self) -> MediaResult<()> {
        if self.0.exists() {
            Ok(())
        } else {
            Err(MediaError::InputNotFound(self.0.clone()))
        }
    }

    pub(crate) fn arg(&self) -> String {
        self.0.to_string_lossy().to_string()
    }
}

impl TryFrom<PathBuf> for MediaHandle {
    type Error = MediaError;

    fn try_from(path: PathBuf) -> MediaResult<Self> {
        MediaHandle::new(path)
    }
}

impl From<MediaHandle> for PathBuf {
    fn from(handle: MediaHandle) -> PathBuf {
        handle.0
    }
}

impl AsRef<Path> for MediaHandle {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Half-open time window `[start, end)` in seconds, `0 <= start < end`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeRange")]
pub struct TimeRange {
    start_seconds: f64,
    end_seconds: f64,
}

#[derive(Deserialize)]
struct RawTimeRange {
    start_seconds: f64,
    end_seconds: f64,
}

impl TryFrom<RawTimeRange> for TimeRange {
    type Error = MediaError;

    fn try_from(raw: RawTimeRange) -> MediaResult<Self> {
        TimeRange::new(raw.start_seconds, raw.end_seconds)
    }
}

impl TimeRange {
    pub fn new(start_seconds: f64, end_seconds: f64) -> MediaResult<Self> {
        if !start_seconds.is_finite() || !end_seconds.is_finite() {
            return Err(MediaError::InvalidRange(format!(
                "non-finite bounds {}..{}",
                start_seconds, end_seconds
            )));
        }
        if start_seconds < 0.0 {
            return Err(MediaError::InvalidRange(format!("negative start {}", start_seconds)));
        }
        if end_seconds <= start_seconds {
            return Err(MediaError::InvalidRange(format!(
                "end {} is not after start {}",
                end_seconds, start_seconds
            )));
        }
        Ok(TimeRange { start_seconds, end_seconds })
    }

    pub fn start_seconds(&self) -> f64 {
        self.start_seconds
    }

    pub fn end_seconds(&self) -> f64 {
        self.end_seconds
    }

    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = MediaError;

    /// Parses `WIDTHxHEIGHT`, e.g. `1920x1080`
    fn from_str(s: &str) -> MediaResult<Self> {
        let bad = || MediaError::InvalidParameter(format!("resolution must look like 1920x1080, got {:?}", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(bad)?;
        let width = w.trim().parse::<u32>().map_err(|_| bad())?;
        let height = h.trim().parse::<u32>().map_err(|_| bad())?;
        Ok(Resolution { width, height })
    }
}

/// Snapshot of a file's stream metadata at probe time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    /// `(0, 0)` for audio-only files
    pub resolution: Resolution,
    pub codec_name: String,
    /// Zero only when there is no video stream
    pub frame_rate: f64,
    pub audio_channel_count: u32,
    /// Zero only when there is no audio stream
    pub audio_sample_rate: u32,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        !self.resolution.is_empty()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_channel_count > 0
    }
}

/// One input to the audio mixer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub handle: MediaHandle,
    pub volume_db: f64,
    #[serde(default)]
    pub start_offset_seconds: f64,
}

impl AudioTrack {
    pub fn new(handle: MediaHandle, volume_db: f64) -> Self {
        AudioTrack { handle, volume_db, start_offset_seconds: 0.0 }
    }

    pub fn with_offset(mut self, start_offset_seconds: f64) -> Self {
        self.start_offset_seconds = start_offset_seconds;
        self
    }

    /// Linear amplitude factor for `volume_db`
    pub fn gain(&self) -> f64 {
        db_to_amplitude(self.volume_db)
    }
}

/// Amplitude ratio for a level in decibels: `10^(db/20)`
pub fn db_to_amplitude(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Top-left pixel position of an overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Position { x, y }
    }
}

/// Text or image drawn on top of a video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlaySpec {
    Text {
        content: String,
        position: Position,
        font: PathBuf,
        size: u32,
        color: String,
    },
    Image {
        handle: MediaHandle,
        position: Position,
        #[serde(default)]
        duration_seconds: Option<f64>,
    },
}

/// A labeled render input; the stream type is fixed when the value is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderInput {
    Video { label: String, handle: MediaHandle },
    Audio { label: String, handle: MediaHandle },
}

impl RenderInput {
    pub fn video(label: impl Into<String>, handle: MediaHandle) -> Self {
        RenderInput::Video { label: label.into(), handle }
    }

    pub fn audio(label: impl Into<String>, handle: MediaHandle) -> Self {
        RenderInput::Audio { label: label.into(), handle }
    }

    pub fn label(&self) -> &str {
        match self {
            RenderInput::Video { label, .. } | RenderInput::Audio { label, .. } => label,
        }
    }

    pub fn handle(&self) -> &MediaHandle {
        match self {
            RenderInput::Video { handle, .. } | RenderInput::Audio { handle, .. } => handle,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, RenderInput::Video { .. })
    }
}

/// Encoding targets for the final mux
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTarget {
    pub resolution: Resolution,
    pub frame_rate: f64,
    pub video_codec: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

/// Everything one renderer invocation needs.
///
/// Only the length cap may be left out; without it the output runs as long
/// as its longest mapped stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSpec {
    pub inputs: Vec<RenderInput>,
    #[serde(flatten)]
    pub target: RenderTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<f64>,
}

/// Container/codec pair for audio extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Flac,
    Aac,
    Opus,
}

impl AudioFormat {
    pub fn codec(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "pcm_s16le",
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::Flac => "flac",
            AudioFormat::Aac => "aac",
            AudioFormat::Opus => "libopus",
        }
    }

    pub fn muxer(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Aac => "adts",
            AudioFormat::Opus => "ogg",
        }
    }
}

impl FromStr for AudioFormat {
    type Err = MediaError;

    fn from_str(s: &str) -> MediaResult<Self> {
        match s.to_lowercase().as_str() {
            "wav" => Ok(AudioFormat::Wav),
            "mp3" => Ok(AudioFormat::Mp3),
            "flac" => Ok(AudioFormat::Flac),
            "aac" => Ok(AudioFormat::Aac),
            "opus" => Ok(AudioFormat::Opus),
            other => Err(MediaError::InvalidParameter(format!("unsupported audio format {:?}", other))),
        }
    }
}
