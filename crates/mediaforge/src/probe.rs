use std::path::Path;

use serde::Deserialize;

use crate::diagnostics::Level;
use crate::engine::Engine;
use crate::error::{MediaError, MediaResult, ProbeError};
use crate::media::{MediaHandle, MediaInfo, Resolution};
use crate::process::ProcessRunner;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub channels: Option<u32>,
    pub sample_rate: Option<String>,
    pub duration: Option<String>,
}

impl FFProbeStream {
    fn is(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }
}

/// Convert an ffprobe rational such as `30000/1001` into frames per second.
///
/// Numerator and denominator are parsed as integers and divided; a zero
/// denominator or a zero rate is an error rather than a default.
pub fn parse_frame_rate(value: &str) -> Result<f64, ProbeError> {
    let invalid = || ProbeError::InvalidFrameRate(value.to_string());
    let (num, den) = value.trim().split_once('/').ok_or_else(invalid)?;
    let num: u64 = num.trim().parse().map_err(|_| invalid())?;
    let den: u64 = den.trim().parse().map_err(|_| invalid())?;
    if den == 0 || num == 0 {
        return Err(invalid());
    }
    Ok(num as f64 / den as f64)
}

fn parse_seconds(path: &Path, field: &str, value: &str) -> Result<f64, ProbeError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| ProbeError::Unparseable {
            path: path.to_path_buf(),
            reason: format!("{} is not a duration: {:?}", field, value),
        })
}

/// Decode the JSON report of `ffprobe -print_format json -show_streams -show_format`
pub fn parse_probe_json(path: &Path, json: &str) -> Result<MediaInfo, ProbeError> {
    let data: FFProbeData = serde_json::from_str(json).map_err(|e| ProbeError::Unparseable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let video = data.streams.iter().find(|s| s.is("video"));
    let audio = data.streams.iter().find(|s| s.is("audio"));
    if video.is_none() && audio.is_none() {
        return Err(ProbeError::NoMediaStreams(path.to_path_buf()));
    }

    // Container duration first, then the longest stream
    let format_duration = data.format.as_ref().and_then(|f| f.duration.as_deref());
    let duration_seconds = match format_duration {
        Some(d) => parse_seconds(path, "format.duration", d)?,
        None => {
            let mut longest: Option<f64> = None;
            for stream in &data.streams {
                if let Some(d) = stream.duration.as_deref() {
                    let d = parse_seconds(path, "stream.duration", d)?;
                    longest = Some(longest.map_or(d, |l: f64| l.max(d)));
                }
            }
            longest.ok_or_else(|| ProbeError::Unparseable {
                path: path.to_path_buf(),
                reason: "no duration in format or streams".to_string(),
            })?
        }
    };

    let (resolution, frame_rate) = match video {
        Some(v) => {
            let (width, height) = v.width.zip(v.height).ok_or_else(|| ProbeError::Unparseable {
                path: path.to_path_buf(),
                reason: format!("video stream {} has no dimensions", v.index),
            })?;
            let rate = v.r_frame_rate.as_deref().ok_or_else(|| ProbeError::Unparseable {
                path: path.to_path_buf(),
                reason: format!("video stream {} has no frame rate", v.index),
            })?;
            (Resolution::new(width, height), parse_frame_rate(rate)?)
        }
        None => (Resolution::default(), 0.0),
    };

    let codec_name = video
        .or(audio)
        .and_then(|s| s.codec_name.clone())
        .unwrap_or_default();

    let (audio_channel_count, audio_sample_rate) = match audio {
        Some(a) => {
            let rate = match a.sample_rate.as_deref() {
                Some(r) => r.trim().parse::<u32>().map_err(|_| ProbeError::Unparseable {
                    path: path.to_path_buf(),
                    reason: format!("audio sample rate {:?}", r),
                })?,
                None => 0,
            };
            (a.channels.unwrap_or(0), rate)
        }
        None => (0, 0),
    };

    Ok(MediaInfo {
        duration_seconds,
        resolution,
        codec_name,
        frame_rate,
        audio_channel_count,
        audio_sample_rate,
    })
}

/// Byte size of a produced file, from filesystem metadata
pub fn stat_size(handle: &MediaHandle) -> MediaResult<u64> {
    std::fs::metadata(handle.path())
        .map(|m| m.len())
        .map_err(|_| MediaError::InputNotFound(handle.path().to_path_buf()))
}

impl<R: ProcessRunner> Engine<R> {
    /// Inspect a media file with the inspection tool
    pub async fn inspect(&self, handle: &MediaHandle) -> Result<MediaInfo, ProbeError> {
        let path = handle.path();

        // Verify file exists before trying to probe
        if !path.exists() {
            return Err(ProbeError::NotFound(path.to_path_buf()));
        }

        let argv = vec![
            self.tools().ffprobe.to_string_lossy().to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            handle.arg(),
        ];
        let output = self.run_argv("probe", argv).await?;
        let info = parse_probe_json(path, &output.stdout)?;

        self.emit(
            Level::Debug,
            "probe",
            format!(
                "{}: {:.3}s {} {} @ {:.3}fps, {} audio channel(s)",
                handle, info.duration_seconds, info.resolution, info.codec_name, info.frame_rate, info.audio_channel_count
            ),
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{audio_json, engine_with, fixture, video_json, ScriptedRunner};
    use proptest::prelude::*;

    fn p() -> &'static Path {
        Path::new("/media/input.mp4")
    }

    #[test]
    fn test_frame_rate_uses_exact_rational_division() {
        assert_eq!(parse_frame_rate("30/1").unwrap(), 30.0);
        assert_eq!(parse_frame_rate("30000/1001").unwrap(), 30000.0 / 1001.0);
        assert_eq!(parse_frame_rate("24000/1001").unwrap(), 24000.0 / 1001.0);
    }

    #[test]
    fn test_frame_rate_rejects_zero_and_garbage() {
        assert!(matches!(parse_frame_rate("30/0"), Err(ProbeError::InvalidFrameRate(_))));
        assert!(matches!(parse_frame_rate("0/0"), Err(ProbeError::InvalidFrameRate(_))));
        assert!(matches!(parse_frame_rate("0/1"), Err(ProbeError::InvalidFrameRate(_))));
        assert!(parse_frame_rate("29.97").is_err());
        assert!(parse_frame_rate("__import__('os')/1").is_err());
        assert!(parse_frame_rate("-30/1").is_err());
    }

    #[test]
    fn test_parse_full_report() {
        let info = parse_probe_json(p(), &video_json(123.456, 1920, 1080, "60/1", true)).unwrap();
        assert_eq!(info.duration_seconds, 123.456);
        assert_eq!(info.resolution, Resolution::new(1920, 1080));
        assert_eq!(info.codec_name, "h264");
        assert_eq!(info.frame_rate, 60.0);
        assert_eq!(info.audio_channel_count, 2);
        assert_eq!(info.audio_sample_rate, 48_000);
    }

    #[test]
    fn test_video_without_audio_reports_zero_channels() {
        let info = parse_probe_json(p(), &video_json(10.0, 1280, 720, "25/1", false)).unwrap();
        assert_eq!(info.audio_channel_count, 0);
        assert!(!info.has_audio());
        assert!(info.has_video());
    }

    #[test]
    fn test_audio_only_has_empty_resolution() {
        let info = parse_probe_json(p(), &audio_json(42.0, 1)).unwrap();
        assert_eq!(info.resolution, Resolution::new(0, 0));
        assert_eq!(info.frame_rate, 0.0);
        assert_eq!(info.audio_channel_count, 1);
        assert_eq!(info.codec_name, "pcm_s16le");
    }

    #[test]
    fn test_zero_denominator_in_video_stream_fails() {
        let json = video_json(10.0, 1280, 720, "25/0", false);
        assert!(matches!(parse_probe_json(p(), &json), Err(ProbeError::InvalidFrameRate(_))));
    }

    #[test]
    fn test_report_without_streams_is_rejected() {
        let json = r#"{"streams":[{"index":0,"codec_type":"subtitle"}],"format":{"duration":"1.0"}}"#;
        assert!(matches!(parse_probe_json(p(), json), Err(ProbeError::NoMediaStreams(_))));
    }

    #[test]
    fn test_garbage_output_is_unparseable() {
        assert!(matches!(parse_probe_json(p(), "not json"), Err(ProbeError::Unparseable { .. })));
    }

    #[test]
    fn test_duration_falls_back_to_longest_stream() {
        let json = r#"{"streams":[
            {"index":0,"codec_type":"video","codec_name":"vp9","width":640,"height":360,"r_frame_rate":"30/1","duration":"9.5"},
            {"index":1,"codec_type":"audio","codec_name":"opus","channels":2,"sample_rate":"48000","duration":"10.02"}
        ],"format":{"format_name":"matroska,webm"}}"#;
        let info = parse_probe_json(p(), json).unwrap();
        assert_eq!(info.duration_seconds, 10.02);
    }

    #[test]
    fn test_missing_duration_everywhere_is_unparseable() {
        let json = r#"{"streams":[{"index":0,"codec_type":"audio","channels":2}],"format":{}}"#;
        assert!(matches!(parse_probe_json(p(), json), Err(ProbeError::Unparseable { .. })));
    }

    #[tokio::test]
    async fn test_inspect_checks_existence_before_spawning() {
        let (engine, dir) = engine_with(ScriptedRunner::new());
        let handle = fixture(&engine, &dir, "gone.mp4", video_json(1.0, 2, 2, "1/1", false));
        std::fs::remove_file(handle.path()).unwrap();

        let err = engine.inspect(&handle).await.unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
        assert!(engine.runner().calls().is_empty());
    }

    #[tokio::test]
    async fn test_inspect_runs_ffprobe_with_json_output() {
        let (engine, dir) = engine_with(ScriptedRunner::new());
        let handle = fixture(&engine, &dir, "in.mp4", video_json(30.0, 1920, 1080, "30/1", true));

        let info = engine.inspect(&handle).await.unwrap();
        assert_eq!(info.duration_seconds, 30.0);

        let calls = engine.runner().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "ffprobe");
        assert!(calls[0].windows(2).any(|w| w[0] == "-print_format" && w[1] == "json"));
        assert_eq!(calls[0].last().unwrap(), &handle.path().to_string_lossy());
    }

    #[tokio::test]
    async fn test_inspect_propagates_tool_failure() {
        let (engine, dir) = engine_with(ScriptedRunner::new());
        let path = dir.path().join("corrupt.mp4");
        std::fs::write(&path, b"junk").unwrap();
        let handle = MediaHandle::new(path).unwrap();

        let err = engine.inspect(&handle).await.unwrap_err();
        assert!(matches!(err, ProbeError::Process(_)));
    }

    #[test]
    fn test_stat_size_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert_eq!(stat_size(&MediaHandle::new(path).unwrap()).unwrap(), 4096);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_frame_rate_matches_division(num in 1u64..1_000_000, den in 1u64..10_000) {
            let rate = parse_frame_rate(&format!("{}/{}", num, den)).unwrap();
            prop_assert_eq!(rate, num as f64 / den as f64);
        }
    }
}
