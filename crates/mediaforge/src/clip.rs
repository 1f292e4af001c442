use std::path::Path;

use crate::diagnostics::Level;
use crate::engine::{check_output, secs, Engine};
use crate::error::{MediaError, MediaResult};
use crate::filtergraph::{FadeDirection, Filter, FilterGraph, StreamRef};
use crate::media::{AudioFormat, MediaHandle, MediaInfo, Resolution, TimeRange};
use crate::process::ProcessRunner;

/// Slack allowed between a requested range end and the probed duration
const RANGE_TOLERANCE_SECS: f64 = 0.01;

/// loudnorm accepts integrated targets in this window
const LUFS_MIN: f64 = -70.0;
const LUFS_MAX: f64 = -5.0;

/// Clip-local start of the fade-out for a clip of `range` with `fade_seconds`
/// fades at each end.
///
/// Fails with `InvalidRange` when the fades would overlap or the fade is
/// negative, so the result is never a negative timestamp.
pub fn fade_out_start(range: &TimeRange, fade_seconds: f64) -> MediaResult<f64> {
    if !fade_seconds.is_finite() || fade_seconds < 0.0 {
        return Err(MediaError::InvalidRange(format!("fade of {}s", fade_seconds)));
    }
    let duration = range.duration();
    if fade_seconds * 2.0 > duration {
        return Err(MediaError::InvalidRange(format!(
            "fades of 2 x {}s do not fit in a {:.3}s clip",
            fade_seconds, duration
        )));
    }
    Ok((duration - fade_seconds).max(0.0))
}

fn check_range_within(range: &TimeRange, info: &MediaInfo, input: &MediaHandle) -> MediaResult<()> {
    if range.end_seconds() > info.duration_seconds + RANGE_TOLERANCE_SECS {
        return Err(MediaError::InvalidRange(format!(
            "range ends at {:.3}s but {} is only {:.3}s long",
            range.end_seconds(),
            input,
            info.duration_seconds
        )));
    }
    Ok(())
}

/// Pull `pts_time:` values out of showinfo lines on the diagnostic channel
pub fn parse_scene_timestamps(stderr: &str) -> Vec<f64> {
    let mut stamps: Vec<f64> = stderr
        .lines()
        .filter(|line| line.contains("showinfo"))
        .filter_map(|line| {
            let rest = &line[line.find("pts_time:")? + "pts_time:".len()..];
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
        .filter(|t| t.is_finite())
        .collect();
    stamps.sort_by(|a, b| a.total_cmp(b));
    stamps.dedup();
    stamps
}

impl<R: ProcessRunner> Engine<R> {
    /// Cut `range` out of `input` with fade-in and fade-out of `fade_seconds`
    /// on every stream present.
    pub async fn extract_clip(
        &self,
        input: &MediaHandle,
        range: TimeRange,
        fade_seconds: f64,
        output: &Path,
    ) -> MediaResult<MediaHandle> {
        input.ensure_exists()?;
        check_output(output, [input])?;
        let fade_out = fade_out_start(&range, fade_seconds)?;

        let info = self.inspect(input).await?;
        check_range_within(&range, &info, input)?;

        let mut args = vec![
            "-ss".to_string(),
            secs(range.start_seconds()),
            "-i".to_string(),
            input.arg(),
            "-t".to_string(),
            secs(range.duration()),
        ];

        if fade_seconds > 0.0 {
            let mut graph = FilterGraph::new();
            let mut maps = Vec::new();
            if info.has_video() {
                graph.chain(
                    vec![StreamRef::video(0)],
                    vec![
                        Filter::Fade { direction: FadeDirection::In, start: 0.0, duration: fade_seconds },
                        Filter::Fade { direction: FadeDirection::Out, start: fade_out, duration: fade_seconds },
                    ],
                    vec!["vout".to_string()],
                )?;
                maps.push(graph.map("vout")?);
            }
            if info.has_audio() {
                graph.chain(
                    vec![StreamRef::audio(0)],
                    vec![
                        Filter::AFade { direction: FadeDirection::In, start: 0.0, duration: fade_seconds },
                        Filter::AFade { direction: FadeDirection::Out, start: fade_out, duration: fade_seconds },
                    ],
                    vec!["aout".to_string()],
                )?;
                maps.push(graph.map("aout")?);
            }
            args.push("-filter_complex".to_string());
            args.push(graph.render());
            for m in maps {
                args.push("-map".to_string());
                args.push(m);
            }
        } else {
            if info.has_video() {
                args.extend(["-map".to_string(), "0:v:0".to_string()]);
            }
            if info.has_audio() {
                args.extend(["-map".to_string(), "0:a:0".to_string()]);
            }
        }
        args.push(output.to_string_lossy().to_string());

        self.emit(
            Level::Info,
            "extract",
            format!(
                "{} [{:.3}s..{:.3}s] fade {:.3}s, fade-out at {:.3}s",
                input,
                range.start_seconds(),
                range.end_seconds(),
                fade_seconds,
                fade_out
            ),
        );
        self.transcode("extract", args, output).await
    }

    /// Single-pass loudness normalization to an absolute integrated target
    pub async fn normalize_audio(&self, input: &MediaHandle, target_lufs: f64, output: &Path) -> MediaResult<MediaHandle> {
        input.ensure_exists()?;
        check_output(output, [input])?;
        if !target_lufs.is_finite() || !(LUFS_MIN..=LUFS_MAX).contains(&target_lufs) {
            return Err(MediaError::InvalidParameter(format!(
                "loudness target {} LUFS outside [{}, {}]",
                target_lufs, LUFS_MIN, LUFS_MAX
            )));
        }

        let info = self.inspect(input).await?;
        if !info.has_audio() {
            return Err(MediaError::NoAudioStream(input.path().to_path_buf()));
        }

        let mut graph = FilterGraph::new();
        graph.chain(
            vec![StreamRef::audio(0)],
            vec![Filter::Loudnorm { integrated_lufs: target_lufs }],
            vec!["aout".to_string()],
        )?;

        let mut args = vec!["-i".to_string(), input.arg(), "-filter_complex".to_string(), graph.render()];
        if info.has_video() {
            args.extend(["-map".to_string(), "0:v:0".to_string(), "-c:v".to_string(), "copy".to_string()]);
        }
        args.extend(["-map".to_string(), graph.map("aout")?]);
        // loudnorm resamples internally; restore the source rate
        args.extend(["-ar".to_string(), info.audio_sample_rate.to_string()]);
        args.push(output.to_string_lossy().to_string());

        self.emit(Level::Info, "normalize", format!("{} -> {} LUFS", input, target_lufs));
        self.transcode("normalize", args, output).await
    }

    /// Demux the first audio stream into `format`
    pub async fn extract_audio(&self, input: &MediaHandle, format: AudioFormat, output: &Path) -> MediaResult<MediaHandle> {
        input.ensure_exists()?;
        check_output(output, [input])?;

        let info = self.inspect(input).await?;
        if !info.has_audio() {
            return Err(MediaError::NoAudioStream(input.path().to_path_buf()));
        }

        let args = vec![
            "-i".to_string(),
            input.arg(),
            "-vn".to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
            "-c:a".to_string(),
            format.codec().to_string(),
            "-f".to_string(),
            format.muxer().to_string(),
            output.to_string_lossy().to_string(),
        ];
        self.transcode("extract_audio", args, output).await
    }

    /// Timestamps (seconds) where the scene score exceeds `threshold`.
    /// An input without scene changes yields an empty list.
    pub async fn detect_scene_boundaries(&self, input: &MediaHandle, threshold: f64) -> MediaResult<Vec<f64>> {
        input.ensure_exists()?;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
            return Err(MediaError::InvalidParameter(format!("scene threshold {} outside (0, 1]", threshold)));
        }

        let info = self.inspect(input).await?;
        if !info.has_video() {
            return Err(MediaError::NoVideoInput);
        }

        let mut graph = FilterGraph::new();
        graph.chain(
            vec![StreamRef::video(0)],
            vec![Filter::SelectScene { threshold }, Filter::ShowInfo],
            vec!["vout".to_string()],
        )?;
        let args = vec![
            "-i".to_string(),
            input.arg(),
            "-filter_complex".to_string(),
            graph.render(),
            "-map".to_string(),
            graph.map("vout")?,
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];

        // showinfo reports at info level
        let output = self.run_argv("scenes", self.ffmpeg_argv("info", args)).await?;
        let stamps = parse_scene_timestamps(&output.stderr);
        self.emit(Level::Info, "scenes", format!("{}: {} boundaries above {}", input, stamps.len(), threshold));
        Ok(stamps)
    }

    /// Stereo silence of `duration_seconds` at `sample_rate`
    pub async fn create_silent_audio(&self, duration_seconds: f64, sample_rate: u32, output: &Path) -> MediaResult<MediaHandle> {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Err(MediaError::InvalidRange(format!("silence of {}s", duration_seconds)));
        }
        if sample_rate == 0 {
            return Err(MediaError::InvalidParameter("sample rate must be positive".to_string()));
        }

        let args = vec![
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("anullsrc=r={}:cl=stereo", sample_rate),
            "-t".to_string(),
            secs(duration_seconds),
            output.to_string_lossy().to_string(),
        ];
        self.transcode("silence", args, output).await
    }

    /// Cut `range` from `input` and centre-crop it to a vertical short at `resolution`
    pub async fn derive_short(
        &self,
        input: &MediaHandle,
        range: TimeRange,
        resolution: Resolution,
        output: &Path,
    ) -> MediaResult<MediaHandle> {
        input.ensure_exists()?;
        check_output(output, [input])?;
        if resolution.is_empty() {
            return Err(MediaError::InvalidParameter(format!("short resolution {}", resolution)));
        }

        let info = self.inspect(input).await?;
        if !info.has_video() {
            return Err(MediaError::NoVideoInput);
        }
        check_range_within(&range, &info, input)?;

        let mut graph = FilterGraph::new();
        graph.chain(
            vec![StreamRef::video(0)],
            vec![
                Filter::CropToAspect { width: resolution.width, height: resolution.height },
                Filter::Scale { width: resolution.width, height: resolution.height },
                Filter::SetSar,
            ],
            vec!["vout".to_string()],
        )?;

        let mut args = vec![
            "-ss".to_string(),
            secs(range.start_seconds()),
            "-i".to_string(),
            input.arg(),
            "-t".to_string(),
            secs(range.duration()),
            "-filter_complex".to_string(),
            graph.render(),
            "-map".to_string(),
            graph.map("vout")?,
        ];
        if info.has_audio() {
            args.extend(["-map".to_string(), "0:a:0".to_string()]);
        }
        args.push(output.to_string_lossy().to_string());

        self.transcode("short", args, output).await
    }
}
