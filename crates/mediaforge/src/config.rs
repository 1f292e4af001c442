use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::{RenderTarget, Resolution};

/// Errors raised while loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON config {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for the rendering engine.
///
/// This is the only place defaults live; engine operations take every
/// target explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Transcoding tool
    pub ffmpeg_bin: PathBuf,
    /// Inspection tool
    pub ffprobe_bin: PathBuf,
    /// Directory for transient per-invocation files (filter scripts)
    pub scratch_dir: PathBuf,
    /// Upper bound on a single external invocation
    pub process_timeout_secs: u64,
    pub video: VideoSettings,
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub resolution: Resolution,
    pub frame_rate: f64,
    pub codec: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub fade_seconds: f64,
    pub crossfade_seconds: f64,
    pub short_resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub narration_lufs: f64,
    pub clip_audio_lufs: f64,
    pub music_lufs: f64,
    pub sample_rate: u32,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(1920, 1080),
            frame_rate: 30.0,
            codec: "libx264".to_string(),
            crf: 20,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            fade_seconds: 0.5,
            crossfade_seconds: 0.5,
            short_resolution: Resolution::new(1080, 1920),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            narration_lufs: -16.0,
            clip_audio_lufs: -26.0,
            music_lufs: -32.0,
            sample_rate: 48_000,
        }
    }
}

impl VideoSettings {
    /// Explicit render target built from the configured defaults
    pub fn render_target(&self) -> RenderTarget {
        RenderTarget {
            resolution: self.resolution,
            frame_rate: self.frame_rate,
            video_codec: self.codec.clone(),
            crf: self.crf,
            audio_codec: self.audio_codec.clone(),
            audio_bitrate: self.audio_bitrate.clone(),
        }
    }
}

impl ForgeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            scratch_dir: std::env::temp_dir().join("mediaforge"),
            process_timeout_secs: 600,
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
        }
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                    path: config_path.to_path_buf(),
                    source,
                })?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content).map_err(|source| ConfigError::Toml {
                        path: config_path.to_path_buf(),
                        source,
                    })?;
                } else {
                    config = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                        path: config_path.to_path_buf(),
                        source,
                    })?;
                }
            }
        }

        Ok(config)
    }
}
