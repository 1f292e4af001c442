use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How many trailing bytes of captured stderr go into error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Outcome classification for a single external process invocation
#[derive(Debug, Error)]
pub enum ProcessFailure {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process timed out after {}s and was killed; stderr: {}", .timeout.as_secs_f64(), tail(.stderr))]
    Timeout {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("process exited with code {}: {}", display_code(.code), tail(.stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("process cancelled; stderr: {}", tail(.stderr))]
    Cancelled { stderr: String },

    #[error("i/o error while supervising process: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the inspection tool or of decoding its report
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("media file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unparseable probe output for {}: {reason}", .path.display())]
    Unparseable { path: PathBuf, reason: String },

    #[error("no video or audio stream in {}", .0.display())]
    NoMediaStreams(PathBuf),

    #[error("invalid frame rate {0:?}")]
    InvalidFrameRate(String),

    #[error("probe process failed: {0}")]
    Process(#[from] ProcessFailure),
}

/// Error taxonomy shared by every clip, composition, mixing and render operation
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Process(#[from] ProcessFailure),

    #[error("malformed filter graph: {0}")]
    Graph(#[from] crate::filtergraph::GraphError),

    #[error("input set is empty")]
    EmptyInputSet,

    #[error("track list is empty")]
    EmptyTrackList,

    #[error("operation needs at least {needed} inputs, got {got}")]
    TooFewInputs { needed: usize, got: usize },

    #[error("render has no video input")]
    NoVideoInput,

    #[error("no audio stream in {}", .0.display())]
    NoAudioStream(PathBuf),

    #[error("tool reported success but produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("unsupported toolchain: {0}")]
    UnsupportedToolchain(String),

    #[error("failed to write scratch file: {0}")]
    Scratch(#[source] io::Error),
}

pub type MediaResult<T> = std::result::Result<T, MediaError>;

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

/// Last few KiB of a captured stream, cut on a char boundary
pub(crate) fn tail(s: &str) -> &str {
    if s.len() <= STDERR_TAIL_BYTES {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL_BYTES;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
