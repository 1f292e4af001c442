use std::collections::HashSet;
use std::path::Path;

use crate::diagnostics::Level;
use crate::engine::{check_output, Engine};
use crate::error::{MediaError, MediaResult};
use crate::filtergraph::{trim_float, Filter, FilterGraph, StreamRef};
use crate::media::{MediaHandle, RenderSpec, RenderTarget};
use crate::process::ProcessRunner;

/// Highest CRF accepted by the encoders we target (libx264 tops out at 51)
const MAX_CRF: u8 = 63;

fn validate_target(target: &RenderTarget) -> MediaResult<()> {
    if target.resolution.is_empty() {
        return Err(MediaError::InvalidParameter(format!("target resolution {}", target.resolution)));
    }
    if !target.frame_rate.is_finite() || target.frame_rate <= 0.0 {
        return Err(MediaError::InvalidParameter(format!("target frame rate {}", target.frame_rate)));
    }
    if target.crf > MAX_CRF {
        return Err(MediaError::InvalidParameter(format!("crf {} above {}", target.crf, MAX_CRF)));
    }
    if target.video_codec.trim().is_empty() || target.audio_codec.trim().is_empty() {
        return Err(MediaError::InvalidParameter("codec names must not be empty".to_string()));
    }
    if target.audio_bitrate.trim().is_empty() {
        return Err(MediaError::InvalidParameter("audio bitrate must not be empty".to_string()));
    }
    Ok(())
}

fn validate_limit(limit: Option<f64>) -> MediaResult<()> {
    match limit {
        Some(secs) if !secs.is_finite() || secs <= 0.0 => {
            Err(MediaError::InvalidRange(format!("render length cap of {}s", secs)))
        }
        _ => Ok(()),
    }
}

/// Argument vector (without the binary and common flags) for one render.
///
/// The position of an entry in `spec.inputs` is its transcoder input index.
/// Video entries are scaled to the target and concatenated in order; audio
/// entries are summed pairwise, or mapped straight through when there is only
/// one. A length cap becomes `-t` on the output.
pub fn build_render_command(spec: &RenderSpec, output: &Path) -> MediaResult<Vec<String>> {
    let video: Vec<usize> = spec.inputs.iter().enumerate().filter(|(_, i)| i.is_video()).map(|(n, _)| n).collect();
    let audio: Vec<usize> = spec.inputs.iter().enumerate().filter(|(_, i)| !i.is_video()).map(|(n, _)| n).collect();
    if video.is_empty() {
        return Err(MediaError::NoVideoInput);
    }
    validate_target(&spec.target)?;
    validate_limit(spec.max_duration_seconds)?;

    let mut seen = HashSet::new();
    for input in &spec.inputs {
        if !seen.insert(input.label()) {
            return Err(MediaError::InvalidParameter(format!("duplicate input label {:?}", input.label())));
        }
    }

    let target = &spec.target;
    let mut graph = FilterGraph::new();
    let scale = || vec![Filter::Scale { width: target.resolution.width, height: target.resolution.height }, Filter::SetSar];

    if let [only] = video.as_slice() {
        graph.chain(vec![StreamRef::video(*only)], scale(), vec!["vout".to_string()])?;
    } else {
        let mut scaled = Vec::with_capacity(video.len());
        for idx in &video {
            scaled.push(StreamRef::label(graph.chain_to(vec![StreamRef::video(*idx)], scale(), "v")?));
        }
        graph.chain(
            scaled,
            vec![Filter::Concat { segments: video.len(), video: 1, audio: 0 }],
            vec!["vout".to_string()],
        )?;
    }

    let mut audio_map = None;
    if audio.len() >= 2 {
        let mut mixed = StreamRef::audio(audio[0]);
        for idx in &audio[1..] {
            mixed = StreamRef::label(graph.chain_to(
                vec![mixed, StreamRef::audio(*idx)],
                vec![Filter::AMix { inputs: 2 }],
                "m",
            )?);
        }
        if let StreamRef::Label(name) = mixed {
            audio_map = Some(graph.map(&name)?);
        }
    } else if let Some(idx) = audio.first() {
        audio_map = Some(format!("{}:a:0", idx));
    }

    let mut args = Vec::new();
    for input in &spec.inputs {
        args.push("-i".to_string());
        args.push(input.handle().arg());
    }
    args.push("-filter_complex".to_string());
    args.push(graph.render());
    args.push("-map".to_string());
    args.push(graph.map("vout")?);

    args.push("-c:v".to_string());
    args.push(target.video_codec.clone());
    args.push("-crf".to_string());
    args.push(target.crf.to_string());
    args.push("-r".to_string());
    args.push(trim_float(target.frame_rate, 6));

    match audio_map {
        Some(map) => {
            args.push("-map".to_string());
            args.push(map);
            args.push("-c:a".to_string());
            args.push(target.audio_codec.clone());
            args.push("-b:a".to_string());
            args.push(target.audio_bitrate.clone());
        }
        None => args.push("-an".to_string()),
    }
    if let Some(secs) = spec.max_duration_seconds {
        args.push("-t".to_string());
        args.push(trim_float(secs, 3));
    }

    args.push(output.to_string_lossy().to_string());
    Ok(args)
}

impl<R: ProcessRunner> Engine<R> {
    /// Scale, concatenate and mux every input of `spec` into `output`
    pub async fn render(&self, spec: &RenderSpec, output: &Path) -> MediaResult<MediaHandle> {
        if !spec.inputs.iter().any(|i| i.is_video()) {
            return Err(MediaError::NoVideoInput);
        }
        for input in &spec.inputs {
            input.handle().ensure_exists()?;
        }
        check_output(output, spec.inputs.iter().map(|i| i.handle()))?;
        let args = build_render_command(spec, output)?;

        for input in &spec.inputs {
            let info = self.inspect(input.handle()).await?;
            if input.is_video() && !info.has_video() {
                return Err(MediaError::InvalidParameter(format!(
                    "input {:?} is tagged video but {} has no video stream",
                    input.label(),
                    input.handle()
                )));
            }
            if !input.is_video() && !info.has_audio() {
                return Err(MediaError::NoAudioStream(input.handle().path().to_path_buf()));
            }
        }

        let videos = spec.inputs.iter().filter(|i| i.is_video()).count();
        self.emit(
            Level::Info,
            "render",
            format!(
                "{} video / {} audio input(s) -> {} @ {}fps, {} crf {}",
                videos,
                spec.inputs.len() - videos,
                spec.target.resolution,
                trim_float(spec.target.frame_rate, 3),
                spec.target.video_codec,
                spec.target.crf
            ),
        );
        self.transcode("render", args, output).await
    }
}
