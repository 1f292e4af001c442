//! End-to-end assembly of one video from a manifest.
//!
//! A run walks `Validated -> Extracting -> Normalizing -> Composing -> Mixing
//! -> Rendering -> Done`. Every stage writes new files named after the run id
//! inside the manifest's work directory and feeds them to the next stage.
//! The first failure stops the run and reports the stage together with the
//! intermediates already written, so the caller can resume from them or
//! start over. Nothing is retried here.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::diagnostics::Level;
use crate::engine::Engine;
use crate::error::{MediaError, MediaResult};
use crate::media::{AudioTrack, MediaHandle, MediaInfo, OverlaySpec, RenderInput, RenderSpec, RenderTarget, Resolution, TimeRange};
use crate::probe::stat_size;
use crate::process::{ProcessRunner, TokioRunner};

/// A source file and the part of it to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceClip {
    pub path: PathBuf,
    pub range: TimeRange,
}

/// Everything a run needs. Numeric targets are explicit; defaults belong to
/// whoever writes the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub clips: Vec<SourceClip>,
    pub fade_seconds: f64,
    pub crossfade_seconds: f64,
    /// Loudness target for every extracted clip; `None` skips normalization
    #[serde(default)]
    pub clip_loudness_lufs: Option<f64>,
    #[serde(default)]
    pub overlays: Vec<OverlaySpec>,
    /// Extra tracks mixed under the program audio
    #[serde(default)]
    pub soundtrack: Vec<AudioTrack>,
    pub target: RenderTarget,
    #[serde(default)]
    pub shorts: Vec<TimeRange>,
    #[serde(default)]
    pub short_resolution: Option<Resolution>,
    pub work_dir: PathBuf,
    pub output: PathBuf,
    /// Leave intermediates in `work_dir` after a successful run
    #[serde(default)]
    pub keep_intermediates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validated,
    Extracting,
    Normalizing,
    Composing,
    Mixing,
    Rendering,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validated => "validated",
            Stage::Extracting => "extracting",
            Stage::Normalizing => "normalizing",
            Stage::Composing => "composing",
            Stage::Mixing => "mixing",
            Stage::Rendering => "rendering",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// The run stopped in `stage`; `completed` lists files written before that
#[derive(Debug, Error)]
#[error("pipeline failed while {stage}: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: MediaError,
    pub completed: Vec<PathBuf>,
}

/// A produced file and what it contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub handle: MediaHandle,
    pub info: MediaInfo,
    pub byte_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: Artifact,
    pub shorts: Vec<Artifact>,
    /// Intermediates still on disk after the run
    pub intermediates: Vec<PathBuf>,
}

/// Stage bookkeeping for one run
struct Progress {
    run_id: Uuid,
    work_dir: PathBuf,
    stage: Stage,
    completed: Vec<PathBuf>,
    /// Final outputs already on disk; never cleaned up
    delivered: Vec<PathBuf>,
}

impl Progress {
    fn fail(&self, cause: MediaError) -> PipelineError {
        let completed = self.completed.iter().chain(&self.delivered).cloned().collect();
        PipelineError { stage: self.stage, cause, completed }
    }

    fn intermediate(&self, name: &str, ext: &str) -> PathBuf {
        self.work_dir.join(format!("{}-{}.{}", self.run_id, name, ext))
    }

    fn record(&mut self, handle: &MediaHandle) {
        self.completed.push(handle.path().to_path_buf());
    }
}

pub struct Pipeline<R = TokioRunner> {
    engine: Engine<R>,
}

impl<R: ProcessRunner> Pipeline<R> {
    pub fn new(engine: Engine<R>) -> Self {
        Pipeline { engine }
    }

    pub fn engine(&self) -> &Engine<R> {
        &self.engine
    }

    fn enter(&self, progress: &mut Progress, stage: Stage) {
        progress.stage = stage;
        self.engine.emit(Level::Info, "pipeline", format!("run {}: {}", progress.run_id, stage));
    }

    pub async fn run(&self, manifest: &Manifest) -> Result<PipelineReport, PipelineError> {
        let started_at = Utc::now();
        let mut progress = Progress {
            run_id: Uuid::new_v4(),
            work_dir: manifest.work_dir.clone(),
            stage: Stage::Validated,
            completed: Vec::new(),
            delivered: Vec::new(),
        };
        self.engine.emit(
            Level::Info,
            "pipeline",
            format!("run {}: {} clip(s) -> {}", progress.run_id, manifest.clips.len(), manifest.output.display()),
        );

        let sources = validate(manifest).map_err(|e| progress.fail(e))?;
        std::fs::create_dir_all(&manifest.work_dir).map_err(|e| progress.fail(MediaError::Scratch(e)))?;

        self.enter(&mut progress, Stage::Extracting);
        let mut clips = Vec::with_capacity(sources.len());
        for (i, (source, clip)) in sources.iter().zip(&manifest.clips).enumerate() {
            let out = progress.intermediate(&format!("clip{}", i), "mp4");
            let handle = self
                .engine
                .extract_clip(source, clip.range, manifest.fade_seconds, &out)
                .await
                .map_err(|e| progress.fail(e))?;
            progress.record(&handle);
            clips.push(handle);
        }

        if let Some(lufs) = manifest.clip_loudness_lufs {
            self.enter(&mut progress, Stage::Normalizing);
            let mut normalized = Vec::with_capacity(clips.len());
            for (i, clip) in clips.into_iter().enumerate() {
                let info = self.engine.inspect(&clip).await.map_err(|e| progress.fail(e.into()))?;
                if !info.has_audio() {
                    normalized.push(clip);
                    continue;
                }
                let out = progress.intermediate(&format!("norm{}", i), "mp4");
                let handle = self.engine.normalize_audio(&clip, lufs, &out).await.map_err(|e| progress.fail(e))?;
                progress.record(&handle);
                normalized.push(handle);
            }
            clips = normalized;
        }

        self.enter(&mut progress, Stage::Composing);
        let mut program = if clips.len() >= 2 {
            let out = progress.intermediate("joined", "mp4");
            let handle = self
                .engine
                .concatenate(&clips, manifest.crossfade_seconds, &out)
                .await
                .map_err(|e| progress.fail(e))?;
            progress.record(&handle);
            handle
        } else {
            clips.into_iter().next().ok_or_else(|| progress.fail(MediaError::EmptyInputSet))?
        };
        for (i, overlay) in manifest.overlays.iter().enumerate() {
            let out = progress.intermediate(&format!("overlay{}", i), "mp4");
            let handle = self.engine.apply_overlay(&program, overlay, &out).await.map_err(|e| progress.fail(e))?;
            progress.record(&handle);
            program = handle;
        }

        let program_info = self.engine.inspect(&program).await.map_err(|e| progress.fail(e.into()))?;
        let mut audio = program_info.has_audio().then(|| program.clone());
        if !manifest.soundtrack.is_empty() {
            self.enter(&mut progress, Stage::Mixing);
            let mut tracks = Vec::with_capacity(manifest.soundtrack.len() + 1);
            if let Some(own) = &audio {
                tracks.push(AudioTrack::new(own.clone(), 0.0));
            }
            tracks.extend(manifest.soundtrack.iter().cloned());
            let out = progress.intermediate("mix", "wav");
            let handle = self.engine.mix(&tracks, &out).await.map_err(|e| progress.fail(e))?;
            progress.record(&handle);
            audio = Some(handle);
        }

        self.enter(&mut progress, Stage::Rendering);
        let mut inputs = vec![RenderInput::video("program", program)];
        if let Some(audio) = audio {
            inputs.push(RenderInput::audio("audio", audio));
        }
        // The mix runs as long as its longest track; cap the render at the program
        let spec = RenderSpec {
            inputs,
            target: manifest.target.clone(),
            max_duration_seconds: (program_info.duration_seconds > 0.0).then_some(program_info.duration_seconds),
        };
        let final_handle = self.engine.render(&spec, &manifest.output).await.map_err(|e| progress.fail(e))?;
        progress.delivered.push(final_handle.path().to_path_buf());
        let output = self.artifact(final_handle).await.map_err(|e| progress.fail(e))?;

        let mut shorts = Vec::with_capacity(manifest.shorts.len());
        if let Some(resolution) = manifest.short_resolution {
            for (i, range) in manifest.shorts.iter().enumerate() {
                let out = short_path(&manifest.output, i);
                let handle = self
                    .engine
                    .derive_short(&output.handle, *range, resolution, &out)
                    .await
                    .map_err(|e| progress.fail(e))?;
                progress.delivered.push(handle.path().to_path_buf());
                shorts.push(self.artifact(handle).await.map_err(|e| progress.fail(e))?);
            }
        }

        self.enter(&mut progress, Stage::Done);
        let intermediates = if manifest.keep_intermediates {
            progress.completed
        } else {
            self.remove_intermediates(&progress.completed)
        };

        Ok(PipelineReport {
            run_id: progress.run_id,
            started_at,
            finished_at: Utc::now(),
            output,
            shorts,
            intermediates,
        })
    }

    async fn artifact(&self, handle: MediaHandle) -> MediaResult<Artifact> {
        let info = self.engine.inspect(&handle).await?;
        let byte_size = stat_size(&handle)?;
        Ok(Artifact { handle, info, byte_size })
    }

    /// Deletes what it can and returns the paths that are still there
    fn remove_intermediates(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut left = Vec::new();
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    self.engine.emit(Level::Warn, "pipeline", format!("could not remove {}: {}", path.display(), e));
                    left.push(path.clone());
                }
            }
        }
        left
    }
}

/// Checks that need no external process; returns one handle per clip
fn validate(manifest: &Manifest) -> MediaResult<Vec<MediaHandle>> {
    if manifest.clips.is_empty() {
        return Err(MediaError::EmptyInputSet);
    }
    let sources = manifest
        .clips
        .iter()
        .map(|c| MediaHandle::new(&c.path))
        .collect::<MediaResult<Vec<_>>>()?;
    if !manifest.fade_seconds.is_finite() || manifest.fade_seconds < 0.0 {
        return Err(MediaError::InvalidRange(format!("fade of {}s", manifest.fade_seconds)));
    }
    for clip in &manifest.clips {
        crate::clip::fade_out_start(&clip.range, manifest.fade_seconds)?;
    }
    if !manifest.crossfade_seconds.is_finite() || manifest.crossfade_seconds < 0.0 {
        return Err(MediaError::InvalidParameter(format!("crossfade of {}s", manifest.crossfade_seconds)));
    }
    if !manifest.shorts.is_empty() && manifest.short_resolution.is_none() {
        return Err(MediaError::InvalidParameter("shorts requested without a short resolution".to_string()));
    }
    if sources.iter().any(|s| s.path() == manifest.output) {
        return Err(MediaError::InvalidParameter(format!(
            "output {} would overwrite a source",
            manifest.output.display()
        )));
    }
    Ok(sources)
}

/// `final.mp4` -> `final-short1.mp4`
fn short_path(output: &Path, index: usize) -> PathBuf {
    let stem = output.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "output".to_string());
    let ext = output.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_else(|| "mp4".to_string());
    output.with_file_name(format!("{}-short{}.{}", stem, index + 1, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{arg_after, audio_json, engine_with_sink, fixture, video_json, ScriptedRunner};

    fn target() -> RenderTarget {
        crate::config::ForgeConfig::default_config().video.render_target()
    }

    fn manifest(dir: &Path, clips: Vec<SourceClip>) -> Manifest {
        Manifest {
            clips,
            fade_seconds: 0.5,
            crossfade_seconds: 0.5,
            clip_loudness_lufs: Some(-16.0),
            overlays: Vec::new(),
            soundtrack: Vec::new(),
            target: target(),
            shorts: Vec::new(),
            short_resolution: None,
            work_dir: dir.join("work"),
            output: dir.join("final.mp4"),
            keep_intermediates: false,
        }
    }

    #[test]
    fn test_short_path_naming() {
        assert_eq!(short_path(Path::new("/out/final.mp4"), 0), PathBuf::from("/out/final-short1.mp4"));
        assert_eq!(short_path(Path::new("/out/final"), 1), PathBuf::from("/out/final-short2.mp4"));
    }

    #[tokio::test]
    async fn test_full_run_walks_every_stage() {
        let (engine, dir, sink) = engine_with_sink(ScriptedRunner::new());
        let a = fixture(&engine, &dir, "a.mp4", video_json(30.0, 1920, 1080, "30/1", true));
        let b = fixture(&engine, &dir, "b.mp4", video_json(20.0, 1920, 1080, "30/1", true));
        let music = fixture(&engine, &dir, "music.mp3", audio_json(120.0, 2));

        let mut m = manifest(
            dir.path(),
            vec![
                SourceClip { path: a.path().to_path_buf(), range: TimeRange::new(5.0, 15.0).unwrap() },
                SourceClip { path: b.path().to_path_buf(), range: TimeRange::new(0.0, 8.0).unwrap() },
            ],
        );
        m.soundtrack = vec![AudioTrack::new(music, -20.0)];
        m.shorts = vec![TimeRange::new(0.0, 5.0).unwrap()];
        m.short_resolution = Some(Resolution::new(1080, 1920));

        let pipeline = Pipeline::new(engine);
        let runner = pipeline.engine().runner();
        runner.set_probe(&dir.path().join("final.mp4"), video_json(17.5, 1920, 1080, "30/1", true));
        runner.set_probe(&dir.path().join("final-short1.mp4"), video_json(5.0, 1080, 1920, "30/1", true));
        set_intermediate_probes(runner, &dir.path().join("work"));

        let report = pipeline.run(&m).await.unwrap();
        assert_eq!(report.output.handle.path(), dir.path().join("final.mp4"));
        assert_eq!(report.output.byte_size, 0);
        assert_eq!(report.shorts.len(), 1);
        assert!(report.finished_at >= report.started_at);
        assert!(report.intermediates.is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);

        let stages: Vec<String> = sink.for_stage("pipeline").into_iter().map(|e| e.message).collect();
        for stage in ["extracting", "normalizing", "composing", "mixing", "rendering", "done"] {
            assert!(stages.iter().any(|m| m.ends_with(stage)), "missing stage {} in {:?}", stage, stages);
        }
    }

    #[tokio::test]
    async fn test_long_soundtrack_does_not_outlast_the_program() {
        let (engine, dir, _sink) = engine_with_sink(ScriptedRunner::new());
        let a = fixture(&engine, &dir, "a.mp4", video_json(30.0, 1920, 1080, "30/1", true));
        let b = fixture(&engine, &dir, "b.mp4", video_json(20.0, 1920, 1080, "30/1", true));
        let music = fixture(&engine, &dir, "music.mp3", audio_json(120.0, 2));

        let mut m = manifest(
            dir.path(),
            vec![
                SourceClip { path: a.path().to_path_buf(), range: TimeRange::new(5.0, 15.0).unwrap() },
                SourceClip { path: b.path().to_path_buf(), range: TimeRange::new(0.0, 8.0).unwrap() },
            ],
        );
        m.soundtrack = vec![AudioTrack::new(music, -20.0)];

        let pipeline = Pipeline::new(engine);
        let runner = pipeline.engine().runner();
        runner.set_probe(&dir.path().join("final.mp4"), video_json(10.0, 1920, 1080, "30/1", true));
        set_intermediate_probes(runner, &dir.path().join("work"));
        pipeline.run(&m).await.unwrap();

        let calls = runner.transcode_calls();
        let render = calls
            .iter()
            .find(|argv| argv.last().is_some_and(|a| a.ends_with("final.mp4")))
            .expect("render call");
        // the joined program probes at 10s while the mix runs for 120s
        assert_eq!(arg_after(render, "-t"), Some("10"));
    }

    #[tokio::test]
    async fn test_failed_short_still_reports_the_finished_render() {
        let (engine, dir, _sink) = engine_with_sink(ScriptedRunner::new());
        let a = fixture(&engine, &dir, "a.mp4", video_json(30.0, 1920, 1080, "30/1", true));

        let mut m = manifest(
            dir.path(),
            vec![SourceClip { path: a.path().to_path_buf(), range: TimeRange::new(5.0, 15.0).unwrap() }],
        );
        m.shorts = vec![TimeRange::new(0.0, 5.0).unwrap()];
        m.short_resolution = Some(Resolution::new(1080, 1920));

        // No probe answer for the short, so its bookkeeping fails after the render
        let pipeline = Pipeline::new(engine);
        let runner = pipeline.engine().runner();
        runner.set_probe(&dir.path().join("final.mp4"), video_json(10.0, 1920, 1080, "30/1", true));
        set_intermediate_probes(runner, &dir.path().join("work"));

        let err = pipeline.run(&m).await.unwrap_err();
        assert!(matches!(err.cause, MediaError::Probe(_)));
        assert!(err.completed.contains(&dir.path().join("final.mp4")));
        assert!(dir.path().join("final.mp4").exists());
    }

    #[tokio::test]
    async fn test_failure_reports_stage_and_completed_intermediates() {
        let (engine, dir, _sink) = engine_with_sink(ScriptedRunner::new());
        let a = fixture(&engine, &dir, "a.mp4", video_json(30.0, 1920, 1080, "30/1", true));
        let b = fixture(&engine, &dir, "b.mp4", video_json(20.0, 1920, 1080, "30/1", true));
        let m = manifest(
            dir.path(),
            vec![
                SourceClip { path: a.path().to_path_buf(), range: TimeRange::new(5.0, 15.0).unwrap() },
                SourceClip { path: b.path().to_path_buf(), range: TimeRange::new(0.0, 8.0).unwrap() },
            ],
        );

        // No probe answers for the intermediates: the first normalization
        // probe fails after both clips were extracted.
        let pipeline = Pipeline::new(engine);
        let err = pipeline.run(&m).await.unwrap_err();
        assert_eq!(err.stage, Stage::Normalizing);
        assert!(matches!(err.cause, MediaError::Probe(_)));
        assert_eq!(err.completed.len(), 2);
        assert!(err.completed.iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_validation_fails_before_any_process() {
        let (engine, dir, _sink) = engine_with_sink(ScriptedRunner::new());
        let pipeline = Pipeline::new(engine);

        let empty = manifest(dir.path(), Vec::new());
        let err = pipeline.run(&empty).await.unwrap_err();
        assert_eq!(err.stage, Stage::Validated);
        assert!(matches!(err.cause, MediaError::EmptyInputSet));

        let missing = manifest(
            dir.path(),
            vec![SourceClip { path: dir.path().join("gone.mp4"), range: TimeRange::new(0.0, 5.0).unwrap() }],
        );
        let err = pipeline.run(&missing).await.unwrap_err();
        assert!(matches!(err.cause, MediaError::InputNotFound(_)));
        assert!(err.completed.is_empty());
        assert!(pipeline.engine().runner().calls().is_empty());
    }

    #[test]
    fn test_manifest_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mp4");
        std::fs::write(&src, b"").unwrap();
        let json = serde_json::json!({
            "clips": [{ "path": src, "range": { "start_seconds": 1.0, "end_seconds": 4.0 } }],
            "fade_seconds": 0.25,
            "crossfade_seconds": 0.0,
            "target": {
                "resolution": { "width": 1280, "height": 720 },
                "frame_rate": 25.0,
                "video_codec": "libx264",
                "crf": 23,
                "audio_codec": "aac",
                "audio_bitrate": "128k"
            },
            "work_dir": dir.path().join("work"),
            "output": dir.path().join("out.mp4")
        });
        let m: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(m.clips[0].range.duration(), 3.0);
        assert!(m.clip_loudness_lufs.is_none());
        assert!(m.overlays.is_empty());
        assert!(!m.keep_intermediates);
        assert!(validate(&m).is_ok());
    }

    /// Answers probes for anything the pipeline writes into `work`. Paths
    /// carry a per-run uuid, so match on the file name suffix instead.
    fn set_intermediate_probes(runner: &ScriptedRunner, work: &Path) {
        runner.set_probe_rule(work, |name| {
            if name.ends_with("-mix.wav") {
                audio_json(20.0, 2)
            } else {
                video_json(10.0, 1920, 1080, "30/1", true)
            }
        });
    }
}
