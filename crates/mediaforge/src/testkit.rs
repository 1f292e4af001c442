//! Scripted process runner and fixtures for engine tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::diagnostics::MemorySink;
use crate::engine::{Engine, Toolchain};
use crate::error::ProcessFailure;
use crate::media::MediaHandle;
use crate::process::{CancelSignal, ProcessOutput, ProcessRunner};

type ProbeRule = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Stands in for ffmpeg/ffprobe: records argv, answers probes from a table
/// and creates whatever file a transcode names last.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    calls: Mutex<Vec<Vec<String>>>,
    probes: Mutex<HashMap<PathBuf, String>>,
    /// Fallback answers for files inside a directory, keyed by file name
    probe_rules: Mutex<Vec<(PathBuf, ProbeRule)>>,
    scripts: Mutex<Vec<String>>,
    stdout_rules: Vec<(String, String)>,
    stderr_rules: Vec<(String, String)>,
    fail_transcode: Option<(i32, String)>,
    skip_output: bool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` to any call whose argv contains `token`
    pub fn with_stdout_for(mut self, token: &str, stdout: &str) -> Self {
        self.stdout_rules.push((token.to_string(), stdout.to_string()));
        self
    }

    pub fn with_stderr_for(mut self, token: &str, stderr: &str) -> Self {
        self.stderr_rules.push((token.to_string(), stderr.to_string()));
        self
    }

    /// Every transcoder call exits with `code`
    pub fn failing(mut self, code: i32, stderr: &str) -> Self {
        self.fail_transcode = Some((code, stderr.to_string()));
        self
    }

    /// Transcoder calls succeed without writing their output
    pub fn without_output(mut self) -> Self {
        self.skip_output = true;
        self
    }

    pub fn set_probe(&self, path: &Path, json: String) {
        self.probes.lock().unwrap().insert(path.to_path_buf(), json);
    }

    /// Answer probes for any file directly inside `dir` with `rule(file_name)`
    pub fn set_probe_rule(&self, dir: &Path, rule: impl Fn(&str) -> String + Send + Sync + 'static) {
        self.probe_rules.lock().unwrap().push((dir.to_path_buf(), Box::new(rule)));
    }

    fn probe_answer(&self, path: &Path) -> Option<String> {
        if let Some(json) = self.probes.lock().unwrap().get(path) {
            return Some(json.clone());
        }
        let name = path.file_name()?.to_string_lossy().to_string();
        let parent = path.parent()?;
        self.probe_rules
            .lock()
            .unwrap()
            .iter()
            .find(|(dir, _)| dir == parent)
            .map(|(_, rule)| rule(&name))
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn transcode_calls(&self) -> Vec<Vec<String>> {
        self.calls().into_iter().filter(|argv| is_transcoder(argv)).collect()
    }

    pub fn probe_calls(&self) -> usize {
        self.calls().iter().filter(|argv| argv[0].ends_with("ffprobe")).count()
    }

    /// Filter scripts as they were on disk while the tool ran
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

fn is_transcoder(argv: &[String]) -> bool {
    argv.first().map(|p| p.ends_with("ffmpeg")).unwrap_or(false)
}

impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        argv: &[String],
        _timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutput, ProcessFailure> {
        self.calls.lock().unwrap().push(argv.to_vec());
        if argv.is_empty() {
            return Err(ProcessFailure::EmptyCommand);
        }
        if cancel.is_cancelled() {
            return Err(ProcessFailure::Cancelled { stderr: String::new() });
        }

        let matching = |rules: &[(String, String)]| {
            rules
                .iter()
                .find(|(token, _)| argv.iter().any(|a| a == token))
                .map(|(_, text)| text.clone())
                .unwrap_or_default()
        };
        let stdout = matching(&self.stdout_rules);
        let stderr = matching(&self.stderr_rules);

        if argv[0].ends_with("ffprobe") {
            let path = PathBuf::from(argv.last().unwrap());
            return match self.probe_answer(&path) {
                Some(json) => Ok(ProcessOutput { exit_code: Some(0), stdout: json, stderr }),
                None => Err(ProcessFailure::NonZeroExit {
                    code: Some(1),
                    stderr: format!("{}: Invalid data found when processing input", path.display()),
                }),
            };
        }

        if let Some(pos) = argv.iter().position(|a| a == "-filter_complex_script") {
            let script = std::fs::read_to_string(&argv[pos + 1]).unwrap_or_default();
            self.scripts.lock().unwrap().push(script);
        }

        if let Some((code, stderr)) = &self.fail_transcode {
            return Err(ProcessFailure::NonZeroExit { code: Some(*code), stderr: stderr.clone() });
        }

        let last = argv.last().unwrap();
        if !self.skip_output && last != "-" && !last.starts_with('-') && argv.len() > 2 {
            std::fs::write(last, b"").map_err(ProcessFailure::Io)?;
        }
        Ok(ProcessOutput { exit_code: Some(0), stdout, stderr })
    }
}

/// Engine over `runner` with a scratch dir inside a fresh temp dir
pub(crate) fn engine_with(runner: ScriptedRunner) -> (Engine<ScriptedRunner>, TempDir) {
    let (engine, dir, _sink) = engine_with_sink(runner);
    (engine, dir)
}

pub(crate) fn engine_with_sink(runner: ScriptedRunner) -> (Engine<ScriptedRunner>, TempDir, Arc<MemorySink>) {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    std::fs::create_dir_all(&scratch).unwrap();
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(runner, Toolchain::default(), Duration::from_secs(30), scratch, sink.clone());
    (engine, dir, sink)
}

/// Create an empty file in `dir` and register its probe report
pub(crate) fn fixture(engine: &Engine<ScriptedRunner>, dir: &TempDir, name: &str, probe_json: String) -> MediaHandle {
    let path = dir.path().join(name);
    std::fs::write(&path, b"").unwrap();
    engine.runner().set_probe(&path, probe_json);
    MediaHandle::new(path).unwrap()
}

/// ffprobe report for a video file, optionally with a stereo 48 kHz audio stream
pub(crate) fn video_json(duration: f64, width: u32, height: u32, rate: &str, with_audio: bool) -> String {
    let audio = if with_audio {
        r#",{"index":1,"codec_type":"audio","codec_name":"aac","channels":2,"sample_rate":"48000","r_frame_rate":"0/0"}"#
    } else {
        ""
    };
    format!(
        r#"{{"streams":[{{"index":0,"codec_type":"video","codec_name":"h264","width":{},"height":{},"r_frame_rate":"{}","avg_frame_rate":"{}"}}{}],"format":{{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"{:.6}"}}}}"#,
        width, height, rate, rate, audio, duration
    )
}

/// ffprobe report for an audio-only file
pub(crate) fn audio_json(duration: f64, channels: u32) -> String {
    format!(
        r#"{{"streams":[{{"index":0,"codec_type":"audio","codec_name":"pcm_s16le","channels":{},"sample_rate":"44100","r_frame_rate":"0/0"}}],"format":{{"format_name":"wav","duration":"{:.6}"}}}}"#,
        channels, duration
    )
}

/// Value following `flag` in an argv
pub(crate) fn arg_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter().position(|a| a == flag).and_then(|i| argv.get(i + 1)).map(|s| s.as_str())
}
