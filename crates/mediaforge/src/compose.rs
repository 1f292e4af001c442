//! Multi-input composition: crossfaded concatenation and overlays.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::diagnostics::Level;
use crate::engine::{check_output, Engine};
use crate::error::{MediaError, MediaResult};
use crate::filtergraph::{Filter, FilterGraph, StreamRef};
use crate::media::{MediaHandle, MediaInfo, OverlaySpec, Position};
use crate::process::ProcessRunner;

/// Sample format every segment is conformed to before audio is joined
const CONCAT_SAMPLE_RATE: u32 = 48_000;
const CONCAT_CHANNEL_LAYOUT: &str = "stereo";
const CONCAT_PIXEL_FORMAT: &str = "yuv420p";

/// Offsets at which each successive segment starts fading in, for segments
/// of `durations` joined with `crossfade` seconds of overlap.
///
/// The i-th offset is the combined length of everything joined so far minus
/// the overlap, so a chain of `xfade` nodes lines up end to end.
pub fn crossfade_offsets(durations: &[f64], crossfade: f64) -> Vec<f64> {
    let mut offsets = Vec::with_capacity(durations.len().saturating_sub(1));
    let Some((first, rest)) = durations.split_first() else {
        return offsets;
    };
    let mut joined = *first;
    for d in rest {
        offsets.push(joined - crossfade);
        joined += d - crossfade;
    }
    offsets
}

/// Length of the concatenation: the sum minus one overlap per join
pub fn concatenated_duration(durations: &[f64], crossfade: f64) -> f64 {
    let joins = durations.len().saturating_sub(1) as f64;
    durations.iter().sum::<f64>() - joins * crossfade
}

/// Filter graph written to a uniquely named file in `dir`; the file goes
/// away when the handle is dropped or closed, including on a failed write.
fn write_filter_script(dir: &Path, graph: &str) -> io::Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let mut script = tempfile::Builder::new().prefix("concat-").suffix(".ffscript").tempfile_in(dir)?;
    script.write_all(graph.as_bytes())?;
    script.flush()?;
    Ok(script)
}

impl<R: ProcessRunner> Engine<R> {
    /// Join `inputs` in order, crossfading audio and video over
    /// `crossfade_seconds` at every seam.
    ///
    /// Every segment is conformed to the first input's resolution and frame
    /// rate. The graph goes to the transcoder through a filter script in the
    /// scratch directory, named per call and removed before returning.
    pub async fn concatenate(
        &self,
        inputs: &[MediaHandle],
        crossfade_seconds: f64,
        output: &Path,
    ) -> MediaResult<MediaHandle> {
        match inputs.len() {
            0 => return Err(MediaError::EmptyInputSet),
            1 => return Err(MediaError::TooFewInputs { needed: 2, got: 1 }),
            _ => {}
        }
        // All of them, before anything is spawned
        for input in inputs {
            input.ensure_exists()?;
        }
        check_output(output, inputs)?;
        if !crossfade_seconds.is_finite() || crossfade_seconds < 0.0 {
            return Err(MediaError::InvalidParameter(format!("crossfade of {}s", crossfade_seconds)));
        }

        let mut infos = Vec::with_capacity(inputs.len());
        for input in inputs {
            infos.push(self.inspect(input).await?);
        }
        let with_audio = segments_have_audio(inputs, &infos)?;
        for (input, info) in inputs.iter().zip(&infos) {
            if !info.has_video() {
                return Err(MediaError::NoVideoInput);
            }
            if crossfade_seconds > 0.0 && crossfade_seconds >= info.duration_seconds {
                return Err(MediaError::InvalidRange(format!(
                    "crossfade of {}s does not fit in {} ({:.3}s)",
                    crossfade_seconds, input, info.duration_seconds
                )));
            }
        }

        let (mut graph, video_out, audio_out) = concat_graph(&infos, crossfade_seconds, with_audio)?;
        let durations: Vec<f64> = infos.iter().map(|i| i.duration_seconds).collect();
        let expected = concatenated_duration(&durations, crossfade_seconds);

        let mut args = Vec::new();
        for input in inputs {
            args.push("-i".to_string());
            args.push(input.arg());
        }
        let script = write_filter_script(self.scratch_dir(), &graph.render()).map_err(MediaError::Scratch)?;
        args.push("-filter_complex_script".to_string());
        args.push(script.path().to_string_lossy().to_string());
        args.push("-map".to_string());
        args.push(graph.map(&video_out)?);
        if let Some(audio_out) = audio_out {
            args.push("-map".to_string());
            args.push(graph.map(&audio_out)?);
        }
        args.push(output.to_string_lossy().to_string());

        self.emit(
            Level::Info,
            "concat",
            format!(
                "{} segments, crossfade {:.3}s, expected length {:.3}s",
                inputs.len(),
                crossfade_seconds,
                expected
            ),
        );
        let result = self.transcode("concat", args, output).await;

        if let Err(e) = script.close() {
            self.emit(Level::Warn, "concat", format!("could not remove filter script: {}", e));
        }
        result
    }

    /// Burn `text` into the video at `position`
    #[allow(clippy::too_many_arguments)]
    pub async fn overlay_text(
        &self,
        input: &MediaHandle,
        text: &str,
        position: Position,
        font: &Path,
        size: u32,
        color: &str,
        output: &Path,
    ) -> MediaResult<MediaHandle> {
        input.ensure_exists()?;
        check_output(output, [input])?;
        if !font.exists() {
            return Err(MediaError::InputNotFound(font.to_path_buf()));
        }
        if size == 0 {
            return Err(MediaError::InvalidParameter("font size must be positive".to_string()));
        }

        let info = self.inspect(input).await?;
        if !info.has_video() {
            return Err(MediaError::NoVideoInput);
        }

        let mut graph = FilterGraph::new();
        graph.chain(
            vec![StreamRef::video(0)],
            vec![Filter::DrawText {
                text: text.to_string(),
                font: font.to_string_lossy().to_string(),
                size,
                color: color.to_string(),
                x: position.x,
                y: position.y,
            }],
            vec!["vout".to_string()],
        )?;

        let mut args = vec![
            "-i".to_string(),
            input.arg(),
            "-filter_complex".to_string(),
            graph.render(),
            "-map".to_string(),
            graph.map("vout")?,
        ];
        push_audio_copy(&mut args, &info, 0);
        args.push(output.to_string_lossy().to_string());

        self.transcode("overlay", args, output).await
    }

    /// Draw `image` over the video at `position`, for the whole input or only
    /// during `[0, duration_seconds]`
    pub async fn overlay_image(
        &self,
        input: &MediaHandle,
        image: &MediaHandle,
        position: Position,
        duration_seconds: Option<f64>,
        output: &Path,
    ) -> MediaResult<MediaHandle> {
        input.ensure_exists()?;
        image.ensure_exists()?;
        check_output(output, [input, image])?;
        if let Some(d) = duration_seconds {
            if !d.is_finite() || d <= 0.0 {
                return Err(MediaError::InvalidRange(format!("overlay duration of {}s", d)));
            }
        }

        let info = self.inspect(input).await?;
        if !info.has_video() {
            return Err(MediaError::NoVideoInput);
        }

        let mut graph = FilterGraph::new();
        graph.chain(
            vec![StreamRef::video(0), StreamRef::video(1)],
            vec![Filter::Overlay { x: position.x, y: position.y, enable_until: duration_seconds }],
            vec!["vout".to_string()],
        )?;

        let mut args = vec![
            "-i".to_string(),
            input.arg(),
            "-i".to_string(),
            image.arg(),
            "-filter_complex".to_string(),
            graph.render(),
            "-map".to_string(),
            graph.map("vout")?,
        ];
        push_audio_copy(&mut args, &info, 0);
        args.push(output.to_string_lossy().to_string());

        self.transcode("overlay", args, output).await
    }

    pub async fn apply_overlay(&self, input: &MediaHandle, overlay: &OverlaySpec, output: &Path) -> MediaResult<MediaHandle> {
        match overlay {
            OverlaySpec::Text { content, position, font, size, color } => {
                self.overlay_text(input, content, *position, font, *size, color, output).await
            }
            OverlaySpec::Image { handle, position, duration_seconds } => {
                self.overlay_image(input, handle, *position, *duration_seconds, output).await
            }
        }
    }
}

/// All segments carry audio, or none do
fn segments_have_audio(inputs: &[MediaHandle], infos: &[MediaInfo]) -> MediaResult<bool> {
    let with_audio = infos.iter().filter(|i| i.has_audio()).count();
    if with_audio == 0 {
        return Ok(false);
    }
    match infos.iter().position(|i| !i.has_audio()) {
        None => Ok(true),
        Some(idx) => Err(MediaError::NoAudioStream(inputs[idx].path().to_path_buf())),
    }
}

/// Builds the conform + join graph and returns it with its output labels
fn concat_graph(
    infos: &[MediaInfo],
    crossfade: f64,
    with_audio: bool,
) -> MediaResult<(FilterGraph, String, Option<String>)> {
    let target = &infos[0];
    let mut graph = FilterGraph::new();
    let mut video = Vec::with_capacity(infos.len());
    let mut audio = Vec::with_capacity(infos.len());

    for i in 0..infos.len() {
        video.push(graph.chain_to(
            vec![StreamRef::video(i)],
            vec![
                Filter::Scale { width: target.resolution.width, height: target.resolution.height },
                Filter::SetSar,
                Filter::Fps(target.frame_rate),
                Filter::PixelFormat(CONCAT_PIXEL_FORMAT.to_string()),
                Filter::SetTb,
            ],
            "v",
        )?);
        if with_audio {
            audio.push(graph.chain_to(
                vec![StreamRef::audio(i)],
                vec![Filter::AFormat {
                    sample_rate: CONCAT_SAMPLE_RATE,
                    channel_layout: CONCAT_CHANNEL_LAYOUT.to_string(),
                }],
                "a",
            )?);
        }
    }

    if crossfade == 0.0 {
        let mut pads = Vec::with_capacity(video.len() + audio.len());
        for (i, v) in video.iter().enumerate() {
            pads.push(StreamRef::label(v));
            if let Some(a) = audio.get(i) {
                pads.push(StreamRef::label(a));
            }
        }
        let mut outputs = vec!["vout".to_string()];
        if with_audio {
            outputs.push("aout".to_string());
        }
        graph.chain(
            pads,
            vec![Filter::Concat { segments: infos.len(), video: 1, audio: usize::from(with_audio) }],
            outputs,
        )?;
        return Ok((graph, "vout".to_string(), with_audio.then(|| "aout".to_string())));
    }

    let durations: Vec<f64> = infos.iter().map(|i| i.duration_seconds).collect();
    let offsets = crossfade_offsets(&durations, crossfade);

    let mut video_iter = video.into_iter();
    let mut joined = video_iter.next().ok_or(MediaError::EmptyInputSet)?;
    for (next, offset) in video_iter.zip(offsets) {
        joined = graph.chain_to(
            vec![StreamRef::label(joined), StreamRef::label(next)],
            vec![Filter::XFade { duration: crossfade, offset }],
            "xv",
        )?;
    }

    let mut audio_out = None;
    let mut audio_iter = audio.into_iter();
    if let Some(first) = audio_iter.next() {
        let mut joined_audio = first;
        for next in audio_iter {
            joined_audio = graph.chain_to(
                vec![StreamRef::label(joined_audio), StreamRef::label(next)],
                vec![Filter::ACrossfade { duration: crossfade }],
                "xa",
            )?;
        }
        audio_out = Some(joined_audio);
    }

    Ok((graph, joined, audio_out))
}

/// Carry the first audio stream of input `index` through untouched
fn push_audio_copy(args: &mut Vec<String>, info: &MediaInfo, index: usize) {
    if info.has_audio() {
        args.push("-map".to_string());
        args.push(format!("{}:a:0", index));
        args.push("-c:a".to_string());
        args.push("copy".to_string());
    }
}
